//! DStore Client - wire protocol clients
//!
//! Every call opens a fresh TCP connection (bounded by a connect timeout),
//! performs one framed exchange and closes it.

pub mod dir;
pub mod osd;

// Re-exports
pub use dir::DirClient;
pub use osd::OsdClient;

use dstore_common::{Error, Result};
use std::time::Duration;
use tokio::io::BufStream;
use tokio::net::TcpStream;

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) async fn connect(address: &str, timeout: Duration) -> Result<BufStream<TcpStream>> {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(BufStream::new(stream))
        }
        Ok(Err(e)) => Err(Error::connection(format!("{address}: {e}"))),
        Err(_) => Err(Error::Timeout),
    }
}

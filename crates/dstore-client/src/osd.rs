//! OSD (Object Storage Daemon) client

use crate::{connect, DEFAULT_CONNECT_TIMEOUT};
use bytes::Bytes;
use dstore_common::{ChunkId, Error, Result, SlaveInfo};
use dstore_proto::message::read_chunk_response;
use dstore_proto::{OsdRequest, Status};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::trace;

/// Client for one storage node
#[derive(Clone, Debug)]
pub struct OsdClient {
    address: String,
    connect_timeout: Duration,
}

impl OsdClient {
    /// Create a new OSD client
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Client for a registered OSD
    #[must_use]
    pub fn for_slave(slave: &SlaveInfo) -> Self {
        Self::new(slave.address())
    }

    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Store a chunk; succeeds only if the OSD acknowledged with `OK`
    pub async fn store_chunk(&self, chunk_id: &ChunkId, data: Bytes) -> Result<()> {
        let len = data.len();
        let request = OsdRequest::StoreChunk {
            chunk_id: chunk_id.to_string(),
            data,
        };
        match self.status_call(&request).await? {
            Status::Ok => {
                trace!("Stored chunk {} ({} bytes) on {}", chunk_id, len, self.address);
                Ok(())
            }
            other => Err(Error::UnexpectedStatus(other.to_string())),
        }
    }

    /// Fetch a chunk, `None` if the OSD does not have it
    pub async fn get_chunk(&self, chunk_id: &ChunkId) -> Result<Option<Bytes>> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        let request = OsdRequest::GetChunk {
            chunk_id: chunk_id.to_string(),
        };
        request.write_to(&mut stream).await?;
        stream.flush().await?;
        read_chunk_response(&mut stream).await
    }

    /// Delete a chunk; absent chunks are not an error
    pub async fn delete_chunk(&self, chunk_id: &ChunkId) -> Result<()> {
        let request = OsdRequest::DeleteChunk {
            chunk_id: chunk_id.to_string(),
        };
        match self.status_call(&request).await? {
            Status::Ok => Ok(()),
            other => Err(Error::UnexpectedStatus(other.to_string())),
        }
    }

    async fn status_call(&self, request: &OsdRequest) -> Result<Status> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        request.write_to(&mut stream).await?;
        stream.flush().await?;
        Status::read_from(&mut stream).await
    }
}

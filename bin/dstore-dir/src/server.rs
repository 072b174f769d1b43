//! DIR protocol server
//!
//! One task per inbound connection, one command per connection.

use crate::coordinator::DirCoordinator;
use dstore_common::shutdown::{join_bounded, SHUTDOWN_GRACE};
use dstore_common::{Error, Result, ShutdownSignal};
use dstore_proto::frame::{read_segment, write_text};
use dstore_proto::message::write_download_response;
use dstore_proto::{DirRequest, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serves the DIR commands over a [`DirCoordinator`]
pub struct DirServer {
    coordinator: Arc<DirCoordinator>,
}

impl DirServer {
    #[must_use]
    pub fn new(coordinator: Arc<DirCoordinator>) -> Arc<Self> {
        Arc::new(Self { coordinator })
    }

    #[must_use]
    pub const fn coordinator(&self) -> &Arc<DirCoordinator> {
        &self.coordinator
    }

    /// Accept connections until `shutdown` fires, then give in-flight
    /// handlers a bounded grace period.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownSignal) {
        if let Ok(addr) = listener.local_addr() {
            info!("DIR: listening on {addr}");
        }
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                () = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        handlers.spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                debug!("DIR: connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("DIR: accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(listener);
        join_bounded(&mut handlers, SHUTDOWN_GRACE, "DIR connection handlers").await;
        info!("DIR: server stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut stream = BufStream::new(stream);
        let request = match DirRequest::read_from(&mut stream).await {
            Ok(request) => request,
            Err(Error::UnknownCommand(command)) => {
                warn!("DIR: unknown command {command:?} from {peer}");
                Status::UnknownCommand.write_to(&mut stream).await?;
                stream.flush().await?;
                return Ok(());
            }
            Err(e) if e.is_protocol() => {
                warn!("DIR: malformed request from {peer}: {e}");
                Status::Error.write_to(&mut stream).await?;
                stream.flush().await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!("DIR: {} from {peer}", request.command());
        self.dispatch(request, &mut stream, peer).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn dispatch(
        &self,
        request: DirRequest,
        stream: &mut BufStream<TcpStream>,
        peer: SocketAddr,
    ) -> Result<()> {
        let coordinator = &self.coordinator;
        match request {
            DirRequest::Upload {
                owner_id,
                file_name,
                declared_size,
            } => {
                let mut upload = coordinator.begin_upload(&owner_id, &file_name);
                loop {
                    match read_segment(stream).await {
                        Ok(Some(segment)) => upload.push(&segment).await,
                        Ok(None) => break,
                        Err(e) => {
                            // The body is cut short: nothing is registered
                            warn!("DIR: upload of {owner_id}/{file_name} aborted: {e}");
                            upload.abort().await;
                            if e.is_protocol() {
                                Status::Error.write_to(stream).await?;
                            }
                            return Ok(());
                        }
                    }
                }
                let declared = u64::try_from(declared_size).unwrap_or(0);
                let status = if upload.finish(declared).await {
                    Status::Ok
                } else {
                    Status::Error
                };
                status.write_to(stream).await
            }
            DirRequest::Download {
                file_name,
                owner_id,
            } => {
                let data = coordinator.download(&owner_id, &file_name).await;
                write_download_response(stream, data.as_deref()).await
            }
            DirRequest::Heartbeat { osd_id, port } => {
                coordinator.on_heartbeat(&osd_id, &peer.ip().to_string(), port);
                Ok(())
            }
            DirRequest::DeleteFile {
                owner_id,
                file_name,
            } => {
                let status = if coordinator.delete(&owner_id, &file_name).await {
                    Status::Ok
                } else {
                    Status::NotFound
                };
                status.write_to(stream).await
            }
            DirRequest::Cluster => write_text(stream, &coordinator.cluster_report()).await,
            DirRequest::Chunks => write_text(stream, &coordinator.chunk_map()).await,
            DirRequest::Stats => write_text(stream, &coordinator.replication_stats()).await,
            DirRequest::Health => write_text(stream, &coordinator.health_report()).await,
            DirRequest::ListFiles { owner_id } => {
                write_text(stream, &coordinator.list_files(&owner_id)).await
            }
            DirRequest::ListAll => write_text(stream, &coordinator.list_all()).await,
        }
    }
}

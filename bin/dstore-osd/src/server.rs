//! OSD protocol server
//!
//! One task per inbound connection; each connection carries exactly one
//! command. Invalid chunk ids are refused before they reach the disk.

use crate::store::ChunkStore;
use dstore_common::shutdown::{join_bounded, SHUTDOWN_GRACE};
use dstore_common::{ChunkId, Error, Result, ShutdownSignal};
use dstore_proto::message::write_chunk_response;
use dstore_proto::{OsdRequest, Status};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Serves STORE_CHUNK / GET_CHUNK / DELETE_CHUNK over a [`ChunkStore`]
pub struct OsdServer {
    store: ChunkStore,
}

impl OsdServer {
    #[must_use]
    pub fn new(store: ChunkStore) -> Arc<Self> {
        Arc::new(Self { store })
    }

    #[must_use]
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Accept connections until `shutdown` fires, then give in-flight
    /// handlers a bounded grace period.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: ShutdownSignal) {
        if let Ok(addr) = listener.local_addr() {
            info!("OSD: listening on {addr}");
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
                                debug!("OSD: connection from {peer} failed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("OSD: accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
                // Reap finished handlers so the set does not grow unbounded
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            }
        }

        drop(listener);
        join_bounded(&mut handlers, SHUTDOWN_GRACE, "OSD connection handlers").await;
        info!("OSD: server stopped");
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut stream = BufStream::new(stream);
        let request = match OsdRequest::read_from(&mut stream).await {
            Ok(request) => request,
            Err(Error::UnknownCommand(command)) => {
                warn!("OSD: unknown command {command:?} from {peer}");
                Status::UnknownCommand.write_to(&mut stream).await?;
                stream.flush().await?;
                return Ok(());
            }
            Err(e) if e.is_protocol() => {
                warn!("OSD: malformed request from {peer}: {e}");
                Status::Error.write_to(&mut stream).await?;
                stream.flush().await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!("OSD: {} {} from {peer}", request.command(), request.chunk_id());
        self.dispatch(request, &mut stream).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn dispatch(&self, request: OsdRequest, stream: &mut BufStream<TcpStream>) -> Result<()> {
        match request {
            OsdRequest::StoreChunk { chunk_id, data } => {
                let status = match ChunkId::parse(chunk_id) {
                    Ok(id) => match self.store.put(&id, &data).await {
                        Ok(()) => Status::Ok,
                        Err(e) => {
                            error!("OSD: failed to store chunk {id}: {e}");
                            Status::Error
                        }
                    },
                    Err(e) => {
                        warn!("OSD: refusing store: {e}");
                        Status::Error
                    }
                };
                status.write_to(stream).await
            }
            OsdRequest::GetChunk { chunk_id } => {
                let Ok(id) = ChunkId::parse(chunk_id) else {
                    return Status::NotFound.write_to(stream).await;
                };
                match self.store.get(&id).await {
                    Ok(data) => write_chunk_response(stream, data.as_deref()).await,
                    Err(e) => {
                        error!("OSD: failed to read chunk {id}: {e}");
                        Status::Error.write_to(stream).await
                    }
                }
            }
            OsdRequest::DeleteChunk { chunk_id } => {
                let status = match ChunkId::parse(chunk_id) {
                    Ok(id) => match self.store.delete(&id).await {
                        Ok(_) => Status::Ok,
                        Err(e) => {
                            error!("OSD: failed to delete chunk {id}: {e}");
                            Status::Error
                        }
                    },
                    Err(e) => {
                        warn!("OSD: refusing delete: {e}");
                        Status::Error
                    }
                };
                status.write_to(stream).await
            }
        }
    }
}

//! DIR coordinator: the file table and the client-facing operations
//!
//! Uploads are cut into fixed-size chunks independent of how the client
//! segments its stream. Each chunk is sent to its placement targets
//! concurrently and only acknowledged copies are recorded as replicas.

use crate::replication::ReplicationManager;
use crate::state::ClusterState;
use bytes::{Bytes, BytesMut};
use dstore_common::{file_key, ChunkId, FileMeta, OsdId, ReplicationConfig};
use dstore_meta_store::MetaStore;
use dstore_placement::HealthStatus;
use futures::future::join_all;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One row of the cluster snapshot
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OsdSnapshot {
    pub osd_id: OsdId,
    /// `None` when the OSD is registered but has no health record
    pub status: Option<HealthStatus>,
    pub address: String,
    pub chunk_count: u64,
}

/// The coordinator. Cheap to share behind an `Arc`.
pub struct DirCoordinator {
    state: Arc<ClusterState>,
    replication: Arc<ReplicationManager>,
}

impl DirCoordinator {
    /// Coordinator over `state`, persisting through `store`
    #[must_use]
    pub fn new(state: Arc<ClusterState>, store: MetaStore, config: ReplicationConfig) -> Self {
        let replication = Arc::new(ReplicationManager::new(Arc::clone(&state), store, config));
        Self { state, replication }
    }

    #[must_use]
    pub const fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    #[must_use]
    pub const fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    /// Register the OSD on its first beat and record the heartbeat
    pub fn on_heartbeat(&self, osd_id: &OsdId, observed_host: &str, port: u16) {
        let previous = self
            .state
            .record_heartbeat(osd_id, observed_host, port, Instant::now());
        if previous == HealthStatus::Down {
            debug!("Heartbeat from {} brought it UP", osd_id);
        }
    }

    /// Start an upload; feed it with [`Upload::push`] and close it with
    /// [`Upload::finish`].
    #[must_use]
    pub fn begin_upload(&self, owner_id: &str, file_name: &str) -> Upload<'_> {
        info!("Upload started: {}", file_key(owner_id, file_name));
        Upload {
            coordinator: self,
            meta: FileMeta::new(owner_id, file_name),
            buffer: BytesMut::with_capacity(self.chunk_size()),
            received: 0,
            failed: false,
        }
    }

    /// Upload an in-memory buffer
    pub async fn upload_bytes(&self, owner_id: &str, file_name: &str, data: &[u8]) -> bool {
        let mut upload = self.begin_upload(owner_id, file_name);
        upload.push(data).await;
        upload.finish(data.len() as u64).await
    }

    fn chunk_size(&self) -> usize {
        self.replication.config().chunk_size
    }

    /// Store one chunk on its placement targets. Returns the OSDs that
    /// acknowledged it.
    async fn store_chunk(&self, chunk_id: &ChunkId, data: Bytes) -> Vec<OsdId> {
        let targets = self.replication.pick_for_write();
        if targets.is_empty() {
            warn!("No alive OSD available for chunk {}", chunk_id.short());
            return Vec::new();
        }

        let sends = targets.iter().map(|target| {
            let client = self.replication.osd_client(target);
            let data = data.clone();
            async move {
                let client = client?;
                match client.store_chunk(chunk_id, data).await {
                    Ok(()) => Some(target.clone()),
                    Err(e) => {
                        warn!("Store of chunk {} on {} failed: {}", chunk_id.short(), target, e);
                        None
                    }
                }
            }
        });
        let acked: Vec<OsdId> = join_all(sends).await.into_iter().flatten().collect();
        for osd in &acked {
            self.state.bump_chunk_count(osd);
        }
        debug!(
            "Chunk {}... stored on {}/{} OSDs",
            chunk_id.short(),
            acked.len(),
            targets.len()
        );
        acked
    }

    /// Reassemble a file. `None` if it is unknown or a chunk has no
    /// reachable replica.
    pub async fn download(&self, owner_id: &str, file_name: &str) -> Option<Bytes> {
        let key = file_key(owner_id, file_name);
        let Some(meta) = self.state.file(&key) else {
            info!("Download of unknown file {}", key);
            return None;
        };
        if meta.chunk_ids.is_empty() {
            return (meta.total_size == 0).then(Bytes::new);
        }

        let statuses = self.state.statuses();
        let mut assembled = BytesMut::with_capacity(usize::try_from(meta.total_size).unwrap_or(0));
        for chunk_id in &meta.chunk_ids {
            let mut data = None;
            for osd in meta.locations(chunk_id) {
                if matches!(statuses.get(osd), Some(HealthStatus::Down)) {
                    continue;
                }
                let Some(client) = self.replication.osd_client(osd) else {
                    continue;
                };
                match client.get_chunk(chunk_id).await {
                    Ok(Some(bytes)) => {
                        data = Some(bytes);
                        break;
                    }
                    Ok(None) => warn!("OSD {} does not have chunk {}", osd, chunk_id.short()),
                    Err(e) => warn!("Fetch of chunk {} from {} failed: {}", chunk_id.short(), osd, e),
                }
            }
            let Some(data) = data else {
                warn!("Download of {} failed: no replica of chunk {}", key, chunk_id.short());
                return None;
            };
            assembled.extend_from_slice(&data);
        }
        info!("Download OK: {} ({} bytes)", key, assembled.len());
        Some(assembled.freeze())
    }

    /// Delete a file and, best effort, every copy of its chunks.
    /// Returns `false` if the file is unknown.
    pub async fn delete(&self, owner_id: &str, file_name: &str) -> bool {
        let key = file_key(owner_id, file_name);
        let Some(meta) = self.replication.forget_file(&key) else {
            return false;
        };
        self.delete_replicas(&meta).await;
        info!("Deleted {} ({} chunks)", key, meta.chunk_count());
        true
    }

    async fn delete_replicas(&self, meta: &FileMeta) {
        let deletes = meta.replicas().map(|(chunk_id, osd)| {
            let client = self.replication.osd_client(osd);
            async move {
                let Some(client) = client else {
                    return;
                };
                if let Err(e) = client.delete_chunk(chunk_id).await {
                    warn!("Delete of chunk {} on {} failed: {}", chunk_id.short(), osd, e);
                }
            }
        });
        join_all(deletes).await;
    }

    // ---- Status queries ----

    /// `name|size|chunks|maxReplicas` per file of `owner_id`
    #[must_use]
    pub fn list_files(&self, owner_id: &str) -> String {
        let mut out = String::new();
        for meta in self.state.files_snapshot() {
            if meta.owner_id == owner_id {
                let _ = writeln!(
                    out,
                    "{}|{}|{}|{}",
                    meta.file_name,
                    meta.total_size,
                    meta.chunk_count(),
                    meta.max_replicas()
                );
            }
        }
        out
    }

    /// `owner|name|size|chunks` per file
    #[must_use]
    pub fn list_all(&self) -> String {
        let mut out = String::new();
        for meta in self.state.files_snapshot() {
            let _ = writeln!(
                out,
                "{}|{}|{}|{}",
                meta.owner_id,
                meta.file_name,
                meta.total_size,
                meta.chunk_count()
            );
        }
        out
    }

    #[must_use]
    pub fn cluster_snapshot(&self) -> Vec<OsdSnapshot> {
        let health = self.state.health_snapshot();
        self.state
            .slaves()
            .into_iter()
            .map(|slave| {
                let record = health.iter().find(|h| h.osd_id == slave.id);
                OsdSnapshot {
                    status: record.map(|h| h.status),
                    chunk_count: record.map_or(0, |h| h.chunk_count),
                    address: slave.address(),
                    osd_id: slave.id,
                }
            })
            .collect()
    }

    /// `id|STATUS|host:port` per registered OSD
    #[must_use]
    pub fn cluster_report(&self) -> String {
        let mut out = String::new();
        for osd in self.cluster_snapshot() {
            let status = osd
                .status
                .map_or_else(|| "UNKNOWN".to_string(), |s| s.to_string());
            let _ = writeln!(out, "{}|{}|{}", osd.osd_id, status, osd.address);
        }
        out
    }

    /// `id|STATUS|chunks=N` per known OSD
    #[must_use]
    pub fn health_report(&self) -> String {
        let mut out = String::new();
        for h in self.state.health_snapshot() {
            let _ = writeln!(out, "{}|{}|chunks={}", h.osd_id, h.status, h.chunk_count);
        }
        out
    }

    /// Per file, per chunk: the replica list
    #[must_use]
    pub fn chunk_map(&self) -> String {
        let files = self.state.files_snapshot();
        if files.is_empty() {
            return "No files registered\n".to_string();
        }
        let mut out = String::new();
        for meta in &files {
            let _ = writeln!(out, "FILE={}", meta.file_name);
            for chunk_id in &meta.chunk_ids {
                let replicas: Vec<&str> = meta.locations(chunk_id).iter().map(OsdId::as_str).collect();
                let _ = writeln!(out, "  {}... => [{}]", chunk_id.short(), replicas.join(", "));
            }
        }
        out
    }

    #[must_use]
    pub fn replication_stats(&self) -> String {
        self.replication.stats_report()
    }
}

/// An upload in progress
pub struct Upload<'a> {
    coordinator: &'a DirCoordinator,
    meta: FileMeta,
    buffer: BytesMut,
    received: u64,
    failed: bool,
}

impl Upload<'_> {
    /// Feed the next piece of the body. Full chunks are stored as soon as
    /// they are complete. After a failure the rest is only counted.
    pub async fn push(&mut self, mut segment: &[u8]) {
        self.received += segment.len() as u64;
        if self.failed {
            return;
        }
        let chunk_size = self.coordinator.chunk_size();
        while !segment.is_empty() {
            let take = (chunk_size - self.buffer.len()).min(segment.len());
            self.buffer.extend_from_slice(&segment[..take]);
            segment = &segment[take..];
            if self.buffer.len() == chunk_size {
                let chunk = self.buffer.split().freeze();
                if !self.store(chunk).await {
                    return;
                }
            }
        }
    }

    async fn store(&mut self, chunk: Bytes) -> bool {
        let chunk_id = ChunkId::generate(&self.meta.owner_id);
        let acked = self.coordinator.store_chunk(&chunk_id, chunk).await;
        if acked.is_empty() {
            warn!(
                "Upload of {} failed: chunk {} has no replica",
                self.meta.key(),
                chunk_id.short()
            );
            self.failed = true;
            self.buffer.clear();
            return false;
        }
        self.meta.push_chunk(chunk_id, acked);
        true
    }

    /// Store the trailing partial chunk and register the file.
    ///
    /// On failure nothing is registered and stored copies are removed.
    pub async fn finish(mut self, declared_size: u64) -> bool {
        if !self.failed && !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.store(chunk).await;
        }

        let key = self.meta.key();
        if self.failed {
            self.coordinator.delete_replicas(&self.meta).await;
            return false;
        }

        if declared_size != self.received {
            warn!(
                "Upload {} declared {} bytes but sent {}",
                key, declared_size, self.received
            );
        }
        self.meta.total_size = self.received;
        self.coordinator.replication.commit_file(self.meta);
        info!("Upload complete: {} ({} bytes)", key, self.received);
        true
    }

    /// Give up on the upload and remove the chunks already stored
    pub async fn abort(self) {
        warn!("Upload of {} aborted after {} bytes", self.meta.key(), self.received);
        self.coordinator.delete_replicas(&self.meta).await;
    }

    /// Bytes received so far
    #[must_use]
    pub const fn received(&self) -> u64 {
        self.received
    }
}

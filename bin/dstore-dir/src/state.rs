//! Shared cluster tables of the coordinator
//!
//! Membership, health and file metadata each sit behind their own lock.
//! Methods take at most one lock at a time and never hold one across an
//! await point, so callers can mix them freely with network I/O.

use dstore_common::{ChunkId, FileMeta, OsdId, SlaveInfo};
use dstore_placement::{Candidate, HealthStatus, OsdHealth};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;
use tracing::info;

/// Cluster state owned by the coordinator and shared with the
/// replication manager.
#[derive(Debug, Default)]
pub struct ClusterState {
    /// Registered OSDs: id -> identity
    pub(crate) osds: RwLock<HashMap<OsdId, SlaveInfo>>,
    /// Health record per known OSD
    pub(crate) health: RwLock<HashMap<OsdId, OsdHealth>>,
    /// File table: file key -> metadata
    pub(crate) files: RwLock<HashMap<String, FileMeta>>,
}

impl ClusterState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State seeded with metadata loaded from disk
    #[must_use]
    pub fn with_files(files: HashMap<String, FileMeta>) -> Self {
        Self {
            files: RwLock::new(files),
            ..Self::default()
        }
    }

    /// Register (first beat only) and record a heartbeat.
    ///
    /// A new health record starts from the replicas the file table already
    /// places on the OSD. Returns the status the OSD had before this beat.
    pub fn record_heartbeat(
        &self,
        osd_id: &OsdId,
        host: &str,
        port: u16,
        at: Instant,
    ) -> HealthStatus {
        {
            let mut osds = self.osds.write();
            if !osds.contains_key(osd_id) {
                info!("Registered OSD {} at {}:{}", osd_id, host, port);
                osds.insert(osd_id.clone(), SlaveInfo::new(osd_id.clone(), host, port));
            }
        }
        let known = self.health.read().contains_key(osd_id);
        let stored = if known { 0 } else { self.replicas_on(osd_id) };
        self.health
            .write()
            .entry(osd_id.clone())
            .or_insert_with(|| {
                let mut health = OsdHealth::new(osd_id.clone());
                health.chunk_count = stored;
                health
            })
            .record_heartbeat(at)
    }

    /// Replicas the file table records on `osd_id`
    #[must_use]
    pub fn replicas_on(&self, osd_id: &OsdId) -> u64 {
        let files = self.files.read();
        let count = files
            .values()
            .flat_map(|meta| meta.replicas())
            .filter(|(_, osd)| *osd == osd_id)
            .count();
        count as u64
    }

    #[must_use]
    pub fn slave(&self, osd_id: &OsdId) -> Option<SlaveInfo> {
        self.osds.read().get(osd_id).cloned()
    }

    /// Registered OSDs sorted by id
    #[must_use]
    pub fn slaves(&self) -> Vec<SlaveInfo> {
        let mut slaves: Vec<SlaveInfo> = self.osds.read().values().cloned().collect();
        slaves.sort_by(|a, b| a.id.cmp(&b.id));
        slaves
    }

    /// Current status of every known OSD
    #[must_use]
    pub fn statuses(&self) -> HashMap<OsdId, HealthStatus> {
        self.health
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), h.status))
            .collect()
    }

    #[must_use]
    pub fn status_of(&self, osd_id: &OsdId) -> Option<HealthStatus> {
        self.health.read().get(osd_id).map(|h| h.status)
    }

    /// Health records sorted by OSD id
    #[must_use]
    pub fn health_snapshot(&self) -> Vec<OsdHealth> {
        let mut records: Vec<OsdHealth> = self.health.read().values().cloned().collect();
        records.sort_by(|a, b| a.osd_id.cmp(&b.osd_id));
        records
    }

    /// Placement candidates: every registered OSD with its health and load
    #[must_use]
    pub fn candidates(&self) -> Vec<Candidate> {
        let registered: Vec<OsdId> = self.osds.read().keys().cloned().collect();
        let health = self.health.read();
        registered
            .into_iter()
            .filter_map(|id| {
                health
                    .get(&id)
                    .map(|h| Candidate::new(id, h.status, h.chunk_count))
            })
            .collect()
    }

    /// Count one more replica on `osd_id`
    pub fn bump_chunk_count(&self, osd_id: &OsdId) {
        if let Some(h) = self.health.write().get_mut(osd_id) {
            h.chunk_count += 1;
        }
    }

    #[must_use]
    pub fn file(&self, file_key: &str) -> Option<FileMeta> {
        self.files.read().get(file_key).cloned()
    }

    /// Insert or replace a file (last write wins)
    pub fn insert_file(&self, meta: FileMeta) {
        self.files.write().insert(meta.key(), meta);
    }

    pub fn remove_file(&self, file_key: &str) -> Option<FileMeta> {
        self.files.write().remove(file_key)
    }

    /// Append a replica to a chunk's location set. Returns `false` if the
    /// file or chunk is gone or the OSD was already listed.
    pub fn add_location(&self, file_key: &str, chunk_id: &ChunkId, osd_id: &OsdId) -> bool {
        self.files
            .write()
            .get_mut(file_key)
            .is_some_and(|meta| meta.add_location(chunk_id, osd_id.clone()))
    }

    /// All files sorted by key
    #[must_use]
    pub fn files_snapshot(&self) -> Vec<FileMeta> {
        let mut files: Vec<FileMeta> = self.files.read().values().cloned().collect();
        files.sort_by_key(FileMeta::key);
        files
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }
}

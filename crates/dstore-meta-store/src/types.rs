//! Stored types for metadata persistence.
//!
//! Records are JSON with camelCase field names. The `version` field was
//! added after the first records were written, so it defaults to 1.

use dstore_common::{ChunkId, FileMeta, OsdId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Version written by this build
pub const RECORD_VERSION: u32 = 1;

const fn default_version() -> u32 {
    1
}

/// On-disk shape of a [`FileMeta`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    pub file_name: String,
    pub owner_id: String,
    pub total_size: u64,
    #[serde(default)]
    pub chunk_ids: Vec<ChunkId>,
    #[serde(default)]
    pub chunk_locations: BTreeMap<ChunkId, Vec<OsdId>>,
}

impl From<&FileMeta> for FileRecord {
    fn from(meta: &FileMeta) -> Self {
        Self {
            version: RECORD_VERSION,
            file_name: meta.file_name.clone(),
            owner_id: meta.owner_id.clone(),
            total_size: meta.total_size,
            chunk_ids: meta.chunk_ids.clone(),
            chunk_locations: meta.chunk_locations.clone(),
        }
    }
}

impl From<FileRecord> for FileMeta {
    fn from(record: FileRecord) -> Self {
        let mut chunk_locations = record.chunk_locations;
        // Every chunk gets a location entry, and entries stay duplicate-free
        for chunk_id in &record.chunk_ids {
            chunk_locations.entry(chunk_id.clone()).or_default();
        }
        for locations in chunk_locations.values_mut() {
            let mut seen = Vec::with_capacity(locations.len());
            locations.retain(|osd| {
                if seen.contains(osd) {
                    false
                } else {
                    seen.push(osd.clone());
                    true
                }
            });
        }
        Self {
            file_name: record.file_name,
            owner_id: record.owner_id,
            total_size: record.total_size,
            chunk_ids: record.chunk_ids,
            chunk_locations,
        }
    }
}

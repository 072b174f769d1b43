//! Core type definitions for DStore
//!
//! This module defines the identifiers and metadata structures shared by
//! the coordinator, the storage daemons and the clients.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Maximum length of a chunk id in bytes (it becomes a file name on the OSD)
pub const MAX_CHUNK_ID_LEN: usize = 255;

/// Largest raw payload or text blob exchanged with a peer
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Longest owner prefix kept in a generated chunk id
const MAX_OWNER_PREFIX_LEN: usize = 64;

/// Identifier of a storage daemon, e.g. `osd-9001`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct OsdId(String);

impl OsdId {
    /// Create an OSD id from an arbitrary string
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id an OSD listening on `port` announces itself with
    #[must_use]
    pub fn from_port(port: u16) -> Self {
        Self(format!("osd-{port}"))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for OsdId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OsdId({})", self.0)
    }
}

impl Borrow<str> for OsdId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OsdId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Identifier of a stored chunk
///
/// Chunk ids double as file names on the OSD, so they are restricted to
/// `[A-Za-z0-9._-]` and may not start with a dot.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[serde(transparent)]
#[display("{_0}")]
pub struct ChunkId(String);

impl ChunkId {
    /// Wrap an existing id without validation
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an id received from a peer
    pub fn parse(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if is_valid_chunk_id(&id) {
            Ok(Self(id))
        } else {
            Err(crate::Error::InvalidChunkId(id))
        }
    }

    /// Generate a fresh id for a chunk owned by `owner_id`.
    ///
    /// The result always passes [`is_valid_chunk_id`], whatever the owner.
    #[must_use]
    pub fn generate(owner_id: &str) -> Self {
        Self(format!("{}_{}", owner_prefix(owner_id), Uuid::new_v4()))
    }

    /// Get the id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form used in logs and chunk-map reports
    #[must_use]
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", self.0)
    }
}

impl Borrow<str> for ChunkId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Check whether `id` is acceptable as an on-disk chunk name
#[must_use]
pub fn is_valid_chunk_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CHUNK_ID_LEN
        && !id.starts_with('.')
        && id.chars().all(is_safe_char)
}

const fn is_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Make `name` safe to use as a single path component.
///
/// Every character outside `[A-Za-z0-9._-]` becomes `_`. Names that would
/// still resolve to `.` or `..` (or are empty) get a leading `_`.
#[must_use]
pub fn sanitize_component(name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if is_safe_char(c) { c } else { '_' })
        .collect();
    if safe.chars().all(|c| c == '.') {
        format!("_{safe}")
    } else {
        safe
    }
}

/// Sanitized, bounded owner part of a generated chunk id
fn owner_prefix(owner_id: &str) -> String {
    let mut prefix = sanitize_component(owner_id);
    if prefix.starts_with('.') {
        prefix.insert(0, '_');
    }
    // Only ASCII survives sanitizing, so any byte index is a char boundary
    prefix.truncate(MAX_OWNER_PREFIX_LEN);
    prefix
}

/// Key of a file in the coordinator table and the metadata store
#[must_use]
pub fn file_key(owner_id: &str, file_name: &str) -> String {
    format!("{owner_id}_{file_name}")
}

/// Identity of a registered storage daemon
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveInfo {
    /// OSD id (join key everywhere else)
    pub id: OsdId,
    /// Host the coordinator reaches the OSD on
    pub host: String,
    /// OSD listen port
    pub port: u16,
}

impl SlaveInfo {
    /// Create a new OSD identity
    #[must_use]
    pub fn new(id: OsdId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
        }
    }

    /// `host:port` string suitable for `TcpStream::connect`
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Metadata of one stored file: its chunks in byte order and where each
/// chunk's replicas live.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileMeta {
    pub file_name: String,
    pub owner_id: String,
    pub total_size: u64,
    /// Chunk ids in byte order of the original file
    pub chunk_ids: Vec<ChunkId>,
    /// Replica set of each chunk, in the order replicas were confirmed
    pub chunk_locations: BTreeMap<ChunkId, Vec<OsdId>>,
}

impl FileMeta {
    /// Create empty metadata for a new upload
    #[must_use]
    pub fn new(owner_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            owner_id: owner_id.into(),
            ..Self::default()
        }
    }

    /// Table key of this file
    #[must_use]
    pub fn key(&self) -> String {
        file_key(&self.owner_id, &self.file_name)
    }

    /// Append a chunk with its confirmed replicas
    pub fn push_chunk(&mut self, chunk_id: ChunkId, replicas: Vec<OsdId>) {
        let mut unique = Vec::with_capacity(replicas.len());
        for osd in replicas {
            if !unique.contains(&osd) {
                unique.push(osd);
            }
        }
        self.chunk_locations.insert(chunk_id.clone(), unique);
        self.chunk_ids.push(chunk_id);
    }

    /// Replicas recorded for a chunk
    #[must_use]
    pub fn locations(&self, chunk_id: &ChunkId) -> &[OsdId] {
        self.chunk_locations
            .get(chunk_id)
            .map_or(&[], Vec::as_slice)
    }

    /// Record a new replica for a chunk of this file.
    ///
    /// Returns `false` if the chunk is unknown or already lists the OSD.
    pub fn add_location(&mut self, chunk_id: &ChunkId, osd_id: OsdId) -> bool {
        match self.chunk_locations.get_mut(chunk_id) {
            Some(locations) if !locations.contains(&osd_id) => {
                locations.push(osd_id);
                true
            }
            _ => false,
        }
    }

    /// Drop replica entries for which `is_known` is false.
    ///
    /// Returns the number of entries removed.
    pub fn prune_locations(&mut self, mut is_known: impl FnMut(&OsdId) -> bool) -> usize {
        let mut removed = 0;
        for locations in self.chunk_locations.values_mut() {
            let before = locations.len();
            locations.retain(|id| is_known(id));
            removed += before - locations.len();
        }
        removed
    }

    /// Number of chunks
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunk_ids.len()
    }

    /// Largest replica set across all chunks
    #[must_use]
    pub fn max_replicas(&self) -> usize {
        self.chunk_locations.values().map(Vec::len).max().unwrap_or(0)
    }

    /// All distinct (chunk, replica) pairs in chunk order
    pub fn replicas(&self) -> impl Iterator<Item = (&ChunkId, &OsdId)> {
        self.chunk_ids
            .iter()
            .flat_map(|chunk| self.locations(chunk).iter().map(move |osd| (chunk, osd)))
    }
}

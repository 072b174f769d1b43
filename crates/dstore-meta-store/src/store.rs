//! Persistent metadata store backed by one JSON file per stored file.
//!
//! The coordinator keeps the authoritative table in memory; this module
//! only handles persistence. Records live at `<dir>/<sanitized key>.json`.

use crate::types::{FileRecord, RECORD_VERSION};
use dstore_common::{sanitize_component, FileMeta};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const RECORD_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

/// Persistent metadata store rooted at a directory.
#[derive(Clone, Debug)]
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    /// Open (or create) the metadata directory.
    pub fn open(dir: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Canonical record path of a file key
    #[must_use]
    pub fn path_for(&self, file_key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXT}", sanitize_component(file_key)))
    }

    /// Durably write the record of `meta`, replacing any previous one.
    pub fn save(&self, meta: &FileMeta) -> MetaStoreResult<()> {
        let file_key = meta.key();
        let path = self.path_for(&file_key);
        let bytes = serde_json::to_vec_pretty(&FileRecord::from(meta))?;

        let tmp = self.dir.join(format!(
            ".{}.{}.{TMP_EXT}",
            sanitize_component(&file_key),
            Uuid::new_v4().simple()
        ));
        let result = write_synced(&tmp, &bytes).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        sync_dir(&self.dir);
        debug!("Persisted metadata for '{}' ({} chunks)", file_key, meta.chunk_count());
        Ok(())
    }

    /// Remove the record of `file_key`. Returns `false` if there was none.
    pub fn delete(&self, file_key: &str) -> MetaStoreResult<bool> {
        match fs::remove_file(self.path_for(file_key)) {
            Ok(()) => {
                sync_dir(&self.dir);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Load every readable record, keyed by file key.
    ///
    /// Unparseable records are logged and skipped. Leftover temp files from
    /// an interrupted save are removed.
    pub fn load_all(&self) -> MetaStoreResult<HashMap<String, FileMeta>> {
        let mut result = HashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }
            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_EXT) => {
                    match fs::remove_file(&path) {
                        Ok(()) => info!("Removed stale temp file {}", path.display()),
                        Err(e) => warn!("Failed to remove stale temp file {}: {}", path.display(), e),
                    }
                    continue;
                }
                Some(RECORD_EXT) => {}
                _ => continue,
            }

            match read_record(&path) {
                Ok(record) => {
                    if record.version > RECORD_VERSION {
                        warn!(
                            "Record {} has version {} (newer than {}), loading anyway",
                            path.display(),
                            record.version,
                            RECORD_VERSION
                        );
                    }
                    let meta = FileMeta::from(record);
                    result.insert(meta.key(), meta);
                }
                Err(e) => error!("Failed to decode metadata record {}: {}", path.display(), e),
            }
        }
        info!("Loaded {} file records from {}", result.len(), self.dir.display());
        Ok(result)
    }
}

fn read_record(path: &Path) -> MetaStoreResult<FileRecord> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Flush the directory entry after a rename; not supported everywhere.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstore_common::{ChunkId, OsdId};

    fn sample(owner: &str, name: &str, chunks: usize) -> FileMeta {
        let mut meta = FileMeta::new(owner, name);
        for i in 0..chunks {
            meta.push_chunk(
                ChunkId::new_unchecked(format!("{owner}_chunk{i}")),
                vec![OsdId::from_port(9001), OsdId::from_port(9002 + i as u16)],
            );
        }
        meta.total_size = chunks as u64 * 1_000_000;
        meta
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let a = sample("1", "a.bin", 3);
        let b = sample("2", "a.bin", 1);
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded["1_a.bin"], a);
        assert_eq!(loaded["2_a.bin"], b);
        assert!(store.path_for("1_a.bin").exists());
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let mut meta = sample("1", "f", 1);
        store.save(&meta).unwrap();
        let chunk = meta.chunk_ids[0].clone();
        meta.add_location(&chunk, OsdId::from_port(9004));
        store.save(&meta).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded["1_f"].locations(&chunk).len(), 3);

        // No temp files left behind
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .path()
                    .extension()
                    .is_some_and(|ext| ext == TMP_EXT)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let meta = sample("5", "gone.txt", 1);
        store.save(&meta).unwrap();
        assert!(store.delete("5_gone.txt").unwrap());
        assert!(!store.delete("5_gone.txt").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_and_foreign_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        store.save(&sample("1", "good", 2)).unwrap();

        fs::write(dir.path().join("broken.json"), b"{ not json").unwrap();
        fs::write(dir.path().join("README"), b"hello").unwrap();
        fs::write(dir.path().join(".1_good.abc.tmp"), b"{").unwrap();
        fs::create_dir(dir.path().join("nested.json")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("1_good"));
        assert!(!dir.path().join(".1_good.abc.tmp").exists());
        assert!(dir.path().join("README").exists());
    }

    #[test]
    fn test_hostile_names_stay_inside_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let meta = sample("..", "../../etc/passwd", 1);
        store.save(&meta).unwrap();
        let path = store.path_for(&meta.key());
        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(path.exists());

        assert_eq!(store.path_for("..").file_name().unwrap(), "_...json");

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[&meta.key()], meta);
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("dir-meta");
        let store = MetaStore::open(&nested).unwrap();
        assert!(nested.is_dir());
        assert!(store.load_all().unwrap().is_empty());
    }
}

//! On-disk chunk storage
//!
//! One file per chunk, named by its id, directly under the storage root.
//! Writes land in a dot-prefixed temp file first and are renamed into
//! place, so a reader never observes a partially written chunk. Valid
//! chunk ids never start with a dot, so temp files cannot shadow chunks.

use bytes::Bytes;
use dstore_common::{ChunkId, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TMP_SUFFIX: &str = ".tmp";

/// Chunk files under a storage root
#[derive(Debug)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Open (or create) the storage root, dropping temp files left by a crash
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let mut entries = fs::read_dir(&root).await?;
        let mut chunks = 0usize;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
                if let Err(e) = fs::remove_file(entry.path()).await {
                    warn!("Failed to remove stale temp file {}: {}", name, e);
                }
            } else if !name.starts_with('.') {
                chunks += 1;
            }
        }
        info!("Chunk store at {} holds {} chunks", root.display(), chunks);
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, chunk_id: &ChunkId) -> PathBuf {
        self.root.join(chunk_id.as_str())
    }

    /// Write a chunk, replacing any previous content
    pub async fn put(&self, chunk_id: &ChunkId, data: &[u8]) -> Result<()> {
        let tmp = self
            .root
            .join(format!(".{}.{}{TMP_SUFFIX}", chunk_id, Uuid::new_v4().simple()));
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, self.path_for(chunk_id)).await
        }
        .await;
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Stored chunk {} ({} bytes)", chunk_id, data.len());
        Ok(())
    }

    /// Read a chunk, `None` if it is not stored here
    pub async fn get(&self, chunk_id: &ChunkId) -> Result<Option<Bytes>> {
        match fs::read(self.path_for(chunk_id)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a chunk. Returns `false` if it was not stored here.
    pub async fn delete(&self, chunk_id: &ChunkId) -> Result<bool> {
        match fs::remove_file(self.path_for(chunk_id)).await {
            Ok(()) => {
                debug!("Deleted chunk {}", chunk_id);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

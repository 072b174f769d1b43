//! DIR (coordinator) client
//!
//! Used by OSDs to send heartbeats and by the CLI for file operations and
//! status reports.

#![allow(clippy::cast_possible_wrap)]

use crate::{connect, DEFAULT_CONNECT_TIMEOUT};
use bytes::Bytes;
use dstore_common::{Error, OsdId, Result};
use dstore_proto::frame::{read_text, write_segment, write_segments_end};
use dstore_proto::message::read_download_response;
use dstore_proto::{DirRequest, Status};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Size of the segments an upload body is sent in
pub const UPLOAD_SEGMENT_SIZE: usize = 64 * 1024;

/// Client for the coordinator
#[derive(Clone, Debug)]
pub struct DirClient {
    address: String,
    connect_timeout: Duration,
}

impl DirClient {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
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

    /// Announce that the OSD `osd_id` listening on `port` is alive.
    /// The DIR does not answer heartbeats.
    pub async fn heartbeat(&self, osd_id: &OsdId, port: u16) -> Result<()> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        DirRequest::Heartbeat {
            osd_id: osd_id.clone(),
            port,
        }
        .write_to(&mut stream)
        .await?;
        stream.flush().await?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Upload an in-memory file. Returns whether the DIR stored it.
    pub async fn upload(&self, owner_id: &str, file_name: &str, data: &[u8]) -> Result<bool> {
        let mut reader = data;
        self.upload_from(owner_id, file_name, data.len() as i64, &mut reader)
            .await
    }

    /// Stream an upload from `reader`. `declared_size` is informational;
    /// the DIR records the number of bytes it actually receives.
    pub async fn upload_from<R: AsyncRead + Unpin>(
        &self,
        owner_id: &str,
        file_name: &str,
        declared_size: i64,
        reader: &mut R,
    ) -> Result<bool> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        DirRequest::Upload {
            owner_id: owner_id.to_string(),
            file_name: file_name.to_string(),
            declared_size,
        }
        .write_to(&mut stream)
        .await?;

        let mut buf = vec![0u8; UPLOAD_SEGMENT_SIZE];
        let mut sent: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            write_segment(&mut stream, &buf[..n]).await?;
            sent += n as u64;
        }
        write_segments_end(&mut stream).await?;
        stream.flush().await?;
        debug!("Uploaded {} bytes of {}/{}", sent, owner_id, file_name);

        match Status::read_from(&mut stream).await? {
            Status::Ok => Ok(true),
            Status::Error => Ok(false),
            other => Err(Error::UnexpectedStatus(other.to_string())),
        }
    }

    /// Download a file, `None` if the DIR does not have it (or lost it)
    pub async fn download(&self, owner_id: &str, file_name: &str) -> Result<Option<Bytes>> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        DirRequest::Download {
            file_name: file_name.to_string(),
            owner_id: owner_id.to_string(),
        }
        .write_to(&mut stream)
        .await?;
        stream.flush().await?;
        read_download_response(&mut stream).await
    }

    /// Delete a file. Returns `false` if it did not exist.
    pub async fn delete(&self, owner_id: &str, file_name: &str) -> Result<bool> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        DirRequest::DeleteFile {
            owner_id: owner_id.to_string(),
            file_name: file_name.to_string(),
        }
        .write_to(&mut stream)
        .await?;
        stream.flush().await?;
        match Status::read_from(&mut stream).await? {
            Status::Ok => Ok(true),
            Status::NotFound => Ok(false),
            other => Err(Error::UnexpectedStatus(other.to_string())),
        }
    }

    /// `name|size|chunks|maxReplicas` lines for one owner
    pub async fn list_files(&self, owner_id: &str) -> Result<String> {
        self.report(DirRequest::ListFiles {
            owner_id: owner_id.to_string(),
        })
        .await
    }

    /// `owner|name|size|chunks` lines for every file
    pub async fn list_all(&self) -> Result<String> {
        self.report(DirRequest::ListAll).await
    }

    /// `id|STATUS|host:port` lines
    pub async fn cluster(&self) -> Result<String> {
        self.report(DirRequest::Cluster).await
    }

    /// `id|STATUS|chunks=N` lines
    pub async fn health(&self) -> Result<String> {
        self.report(DirRequest::Health).await
    }

    /// Replication statistics block
    pub async fn stats(&self) -> Result<String> {
        self.report(DirRequest::Stats).await
    }

    /// Per-file chunk placement map
    pub async fn chunks(&self) -> Result<String> {
        self.report(DirRequest::Chunks).await
    }

    async fn report(&self, request: DirRequest) -> Result<String> {
        let mut stream = connect(&self.address, self.connect_timeout).await?;
        request.write_to(&mut stream).await?;
        stream.flush().await?;
        read_text(&mut stream).await
    }
}

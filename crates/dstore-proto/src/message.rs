//! Typed request sets of the DIR and OSD servers
//!
//! A request starts with its command name as a short string. Decoding
//! an unrecognised name yields [`Error::UnknownCommand`] so the server
//! can answer `UNKNOWN_COMMAND` and close.

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use crate::frame::{read_blob, read_bool, read_str, write_blob, write_bool, write_str};
use bytes::Bytes;
use dstore_common::{Error, OsdId, Result};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Status word answered by both servers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    NotFound,
    Error,
    UnknownCommand,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
            Self::Error => "ERROR",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
        }
    }

    /// Parse a status word received from a peer
    pub fn parse(word: &str) -> Result<Self> {
        match word {
            "OK" => Ok(Self::Ok),
            "NOT_FOUND" => Ok(Self::NotFound),
            "ERROR" => Ok(Self::Error),
            "UNKNOWN_COMMAND" => Ok(Self::UnknownCommand),
            other => Err(Error::UnexpectedStatus(other.to_string())),
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        Self::parse(&read_str(r).await?)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(self, w: &mut W) -> Result<()> {
        write_str(w, self.as_str()).await
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests understood by the DIR
///
/// `Upload` only covers the header. The body follows on the same stream
/// as segments (see [`crate::frame::read_segment`]) and is consumed by
/// the handler, which then answers with a [`Status`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DirRequest {
    Upload {
        owner_id: String,
        file_name: String,
        declared_size: i64,
    },
    Download {
        file_name: String,
        owner_id: String,
    },
    Heartbeat {
        osd_id: OsdId,
        port: u16,
    },
    Cluster,
    Chunks,
    Stats,
    Health,
    ListFiles {
        owner_id: String,
    },
    DeleteFile {
        owner_id: String,
        file_name: String,
    },
    ListAll,
}

impl DirRequest {
    pub const UPLOAD: &'static str = "UPLOAD";
    pub const DOWNLOAD: &'static str = "DOWNLOAD";
    pub const HEARTBEAT: &'static str = "HEARTBEAT";
    pub const CLUSTER: &'static str = "CLUSTER";
    pub const CHUNKS: &'static str = "CHUNKS";
    pub const STATS: &'static str = "STATS";
    pub const HEALTH: &'static str = "HEALTH";
    pub const LIST_FILES: &'static str = "LIST_FILES";
    pub const DELETE_FILE: &'static str = "DELETE_FILE";
    pub const LIST_ALL: &'static str = "LIST_ALL";

    /// Command name on the wire
    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::Upload { .. } => Self::UPLOAD,
            Self::Download { .. } => Self::DOWNLOAD,
            Self::Heartbeat { .. } => Self::HEARTBEAT,
            Self::Cluster => Self::CLUSTER,
            Self::Chunks => Self::CHUNKS,
            Self::Stats => Self::STATS,
            Self::Health => Self::HEALTH,
            Self::ListFiles { .. } => Self::LIST_FILES,
            Self::DeleteFile { .. } => Self::DELETE_FILE,
            Self::ListAll => Self::LIST_ALL,
        }
    }

    /// Decode a request header
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let command = read_str(r).await?;
        let request = match command.as_str() {
            Self::UPLOAD => Self::Upload {
                owner_id: read_str(r).await?,
                file_name: read_str(r).await?,
                declared_size: r.read_i64().await?,
            },
            Self::DOWNLOAD => Self::Download {
                file_name: read_str(r).await?,
                owner_id: read_str(r).await?,
            },
            Self::HEARTBEAT => {
                let osd_id = OsdId::new(read_str(r).await?);
                let raw_port = r.read_i32().await?;
                let port = u16::try_from(raw_port)
                    .map_err(|_| Error::protocol(format!("invalid port {raw_port}")))?;
                Self::Heartbeat { osd_id, port }
            }
            Self::CLUSTER => Self::Cluster,
            Self::CHUNKS => Self::Chunks,
            Self::STATS => Self::Stats,
            Self::HEALTH => Self::Health,
            Self::LIST_FILES => Self::ListFiles {
                owner_id: read_str(r).await?,
            },
            Self::DELETE_FILE => Self::DeleteFile {
                owner_id: read_str(r).await?,
                file_name: read_str(r).await?,
            },
            Self::LIST_ALL => Self::ListAll,
            _ => return Err(Error::UnknownCommand(command)),
        };
        Ok(request)
    }

    /// Encode a request header
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        write_str(w, self.command()).await?;
        match self {
            Self::Upload {
                owner_id,
                file_name,
                declared_size,
            } => {
                write_str(w, owner_id).await?;
                write_str(w, file_name).await?;
                w.write_i64(*declared_size).await?;
            }
            Self::Download {
                file_name,
                owner_id,
            } => {
                write_str(w, file_name).await?;
                write_str(w, owner_id).await?;
            }
            Self::Heartbeat { osd_id, port } => {
                write_str(w, osd_id.as_str()).await?;
                w.write_i32(i32::from(*port)).await?;
            }
            Self::ListFiles { owner_id } => write_str(w, owner_id).await?,
            Self::DeleteFile {
                owner_id,
                file_name,
            } => {
                write_str(w, owner_id).await?;
                write_str(w, file_name).await?;
            }
            Self::Cluster | Self::Chunks | Self::Stats | Self::Health | Self::ListAll => {}
        }
        Ok(())
    }
}

/// Requests understood by an OSD
///
/// Chunk ids are carried raw; the OSD validates them before touching disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsdRequest {
    StoreChunk { chunk_id: String, data: Bytes },
    GetChunk { chunk_id: String },
    DeleteChunk { chunk_id: String },
}

impl OsdRequest {
    pub const STORE_CHUNK: &'static str = "STORE_CHUNK";
    pub const GET_CHUNK: &'static str = "GET_CHUNK";
    pub const DELETE_CHUNK: &'static str = "DELETE_CHUNK";

    #[must_use]
    pub const fn command(&self) -> &'static str {
        match self {
            Self::StoreChunk { .. } => Self::STORE_CHUNK,
            Self::GetChunk { .. } => Self::GET_CHUNK,
            Self::DeleteChunk { .. } => Self::DELETE_CHUNK,
        }
    }

    #[must_use]
    pub fn chunk_id(&self) -> &str {
        match self {
            Self::StoreChunk { chunk_id, .. }
            | Self::GetChunk { chunk_id }
            | Self::DeleteChunk { chunk_id } => chunk_id,
        }
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let command = read_str(r).await?;
        let request = match command.as_str() {
            Self::STORE_CHUNK => Self::StoreChunk {
                chunk_id: read_str(r).await?,
                data: read_blob(r).await?,
            },
            Self::GET_CHUNK => Self::GetChunk {
                chunk_id: read_str(r).await?,
            },
            Self::DELETE_CHUNK => Self::DeleteChunk {
                chunk_id: read_str(r).await?,
            },
            _ => return Err(Error::UnknownCommand(command)),
        };
        Ok(request)
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        write_str(w, self.command()).await?;
        write_str(w, self.chunk_id()).await?;
        if let Self::StoreChunk { data, .. } = self {
            write_blob(w, data).await?;
        }
        Ok(())
    }
}

/// Write the answer to `DOWNLOAD`: a found flag, then an i64 length and the bytes
pub async fn write_download_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    data: Option<&[u8]>,
) -> Result<()> {
    write_bool(w, data.is_some()).await?;
    if let Some(data) = data {
        w.write_i64(data.len() as i64).await?;
        w.write_all(data).await?;
    }
    Ok(())
}

/// Read the answer to `DOWNLOAD`
pub async fn read_download_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Bytes>> {
    if !read_bool(r).await? {
        return Ok(None);
    }
    let len = r.read_i64().await?;
    let len = u64::try_from(len).map_err(|_| Error::protocol(format!("negative length {len}")))?;
    // Grow as bytes arrive instead of trusting the prefix for the allocation
    let mut buf = Vec::new();
    r.take(len).read_to_end(&mut buf).await?;
    if buf.len() as u64 != len {
        return Err(Error::protocol(format!(
            "download truncated: expected {len} bytes, got {}",
            buf.len()
        )));
    }
    Ok(Some(Bytes::from(buf)))
}

/// Write the answer to `GET_CHUNK`
pub async fn write_chunk_response<W: AsyncWrite + Unpin>(
    w: &mut W,
    data: Option<&[u8]>,
) -> Result<()> {
    match data {
        Some(data) => {
            Status::Ok.write_to(w).await?;
            write_blob(w, data).await
        }
        None => Status::NotFound.write_to(w).await,
    }
}

/// Read the answer to `GET_CHUNK`
pub async fn read_chunk_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Bytes>> {
    match Status::read_from(r).await? {
        Status::Ok => read_blob(r).await.map(Some),
        Status::NotFound => Ok(None),
        other => Err(Error::UnexpectedStatus(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode_dir(request: &DirRequest) -> DirRequest {
        let mut buf = Vec::new();
        request.write_to(&mut buf).await.unwrap();
        let mut reader = buf.as_slice();
        let decoded = DirRequest::read_from(&mut reader).await.unwrap();
        assert!(reader.is_empty());
        decoded
    }

    #[tokio::test]
    async fn test_download_field_order() {
        let request = DirRequest::Download {
            file_name: "a.txt".into(),
            owner_id: "7".into(),
        };
        let mut buf = Vec::new();
        request.write_to(&mut buf).await.unwrap();

        // command, then file name, then owner
        let mut reader = buf.as_slice();
        assert_eq!(read_str(&mut reader).await.unwrap(), "DOWNLOAD");
        assert_eq!(read_str(&mut reader).await.unwrap(), "a.txt");
        assert_eq!(read_str(&mut reader).await.unwrap(), "7");
    }

    #[tokio::test]
    async fn test_heartbeat_and_queries() {
        let heartbeat = DirRequest::Heartbeat {
            osd_id: OsdId::from_port(9002),
            port: 9002,
        };
        assert_eq!(decode_dir(&heartbeat).await, heartbeat);
        assert_eq!(decode_dir(&DirRequest::Stats).await, DirRequest::Stats);
        let upload = DirRequest::Upload {
            owner_id: "1".into(),
            file_name: "big.bin".into(),
            declared_size: 2_500_000,
        };
        assert_eq!(decode_dir(&upload).await, upload);
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let mut buf = Vec::new();
        write_str(&mut buf, "FORMAT_DISK").await.unwrap();
        let mut reader = buf.as_slice();
        match DirRequest::read_from(&mut reader).await {
            Err(Error::UnknownCommand(name)) => assert_eq!(name, "FORMAT_DISK"),
            other => panic!("unexpected: {other:?}"),
        }

        let mut reader = buf.as_slice();
        assert!(matches!(
            OsdRequest::read_from(&mut reader).await,
            Err(Error::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_port_out_of_range() {
        let mut buf = Vec::new();
        write_str(&mut buf, "HEARTBEAT").await.unwrap();
        write_str(&mut buf, "osd-1").await.unwrap();
        buf.extend_from_slice(&70_000i32.to_be_bytes());
        let mut reader = buf.as_slice();
        assert!(matches!(
            DirRequest::read_from(&mut reader).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_store_chunk_request() {
        let request = OsdRequest::StoreChunk {
            chunk_id: "1_abc".into(),
            data: Bytes::from_static(b"payload"),
        };
        let mut buf = Vec::new();
        request.write_to(&mut buf).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(OsdRequest::read_from(&mut reader).await.unwrap(), request);
    }

    #[tokio::test]
    async fn test_download_response() {
        let mut buf = Vec::new();
        write_download_response(&mut buf, Some(&b"abc"[..])).await.unwrap();
        write_download_response(&mut buf, None).await.unwrap();
        write_download_response(&mut buf, Some(&b""[..])).await.unwrap();

        let mut reader = buf.as_slice();
        assert_eq!(
            read_download_response(&mut reader).await.unwrap().as_deref(),
            Some(&b"abc"[..])
        );
        assert_eq!(read_download_response(&mut reader).await.unwrap(), None);
        assert_eq!(
            read_download_response(&mut reader).await.unwrap().as_deref(),
            Some(&b""[..])
        );
    }

    #[tokio::test]
    async fn test_truncated_download() {
        let mut buf = Vec::new();
        write_bool(&mut buf, true).await.unwrap();
        buf.extend_from_slice(&100i64.to_be_bytes());
        buf.extend_from_slice(b"short");
        let mut reader = buf.as_slice();
        assert!(matches!(
            read_download_response(&mut reader).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_response() {
        let mut buf = Vec::new();
        write_chunk_response(&mut buf, None).await.unwrap();
        Status::Error.write_to(&mut buf).await.unwrap();
        let mut reader = buf.as_slice();
        assert_eq!(read_chunk_response(&mut reader).await.unwrap(), None);
        assert!(matches!(
            read_chunk_response(&mut reader).await,
            Err(Error::UnexpectedStatus(_))
        ));
    }

    #[test]
    fn test_status_words() {
        assert_eq!(Status::parse("NOT_FOUND").unwrap(), Status::NotFound);
        assert_eq!(Status::UnknownCommand.to_string(), "UNKNOWN_COMMAND");
        assert!(Status::parse("MAYBE").is_err());
    }
}

//! Primitive encoders shared by every command
//!
//! - short string: u16 BE length + UTF-8
//! - text blob: i32 BE length + UTF-8 (reports larger than 64 KiB)
//! - raw payload: i32 BE length + bytes, capped at [`MAX_FRAME_SIZE`]
//! - upload body: raw-payload segments terminated by a length of [`UPLOAD_END`]

#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

use bytes::Bytes;
use dstore_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use dstore_common::MAX_FRAME_SIZE;

/// Segment length marking the end of an upload body
pub const UPLOAD_END: i32 = -1;

/// Read a u16-prefixed string
pub async fn read_str<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let len = r.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| Error::protocol(format!("invalid UTF-8 string: {e}")))
}

/// Write a u16-prefixed string
pub async fn write_str<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| Error::FrameTooLarge {
        size: s.len(),
        max: u16::MAX as usize,
    })?;
    w.write_u16(len).await?;
    w.write_all(s.as_bytes()).await?;
    Ok(())
}

/// Read an i32-prefixed text blob
pub async fn read_text<R: AsyncRead + Unpin>(r: &mut R) -> Result<String> {
    let buf = read_blob(r).await?;
    String::from_utf8(buf.to_vec()).map_err(|e| Error::protocol(format!("invalid UTF-8 text: {e}")))
}

/// Write an i32-prefixed text blob
pub async fn write_text<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> Result<()> {
    write_blob(w, s.as_bytes()).await
}

/// Validate a length prefix received from a peer
fn checked_len(len: i32) -> Result<usize> {
    let len = usize::try_from(len).map_err(|_| Error::protocol(format!("negative length {len}")))?;
    if len > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(len)
}

async fn read_exact_bytes<R: AsyncRead + Unpin>(r: &mut R, len: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Read an i32-prefixed raw payload
pub async fn read_blob<R: AsyncRead + Unpin>(r: &mut R) -> Result<Bytes> {
    let len = checked_len(r.read_i32().await?)?;
    read_exact_bytes(r, len).await
}

/// Write an i32-prefixed raw payload
pub async fn write_blob<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    w.write_i32(data.len() as i32).await?;
    w.write_all(data).await?;
    Ok(())
}

pub async fn read_bool<R: AsyncRead + Unpin>(r: &mut R) -> Result<bool> {
    Ok(r.read_u8().await? != 0)
}

pub async fn write_bool<W: AsyncWrite + Unpin>(w: &mut W, value: bool) -> Result<()> {
    w.write_u8(u8::from(value)).await?;
    Ok(())
}

/// Read the next upload segment, `None` once the terminator is reached
pub async fn read_segment<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Bytes>> {
    let len = r.read_i32().await?;
    if len == UPLOAD_END {
        return Ok(None);
    }
    let len = checked_len(len)?;
    read_exact_bytes(r, len).await.map(Some)
}

/// Write one upload segment
pub async fn write_segment<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> Result<()> {
    write_blob(w, data).await
}

/// Terminate an upload body
pub async fn write_segments_end<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    w.write_i32(UPLOAD_END).await?;
    Ok(())
}

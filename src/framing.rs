//! Length-prefixed JSON framing for the native-messaging transport
//!
//! Each frame is a little-endian unsigned 32-bit length followed by exactly
//! that many bytes of UTF-8 JSON. The mail client speaks this framing over
//! the host's stdin/stdout; anything written to stdout that is not a valid
//! frame is a correctness bug, so diagnostics go to stderr only.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame payload size: 1 MiB.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Failure taxonomy for the framing layer.
///
/// `Eof` is a clean end of stream between frames. The two `Truncated`
/// variants mean the stream died mid-frame and the reader is desynchronized;
/// the loop treats those as unrecoverable. The remaining variants are
/// per-frame faults the loop reports and survives.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("end of stream")]
    Eof,

    #[error("stream ended inside a length prefix")]
    TruncatedLength,

    #[error("stream ended inside a frame payload ({got} of {want} bytes)")]
    TruncatedPayload { want: usize, got: usize },

    #[error("frame payload is not valid UTF-8")]
    NotUtf8,

    #[error("frame payload is not valid JSON: {0}")]
    MalformedJson(String),

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
}

impl FrameError {
    /// Wire code reported back to the client for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Eof => "eof",
            Self::TruncatedLength => "truncated_length",
            Self::TruncatedPayload { .. } => "truncated_payload",
            Self::NotUtf8 => "not_utf8",
            Self::MalformedJson(_) => "malformed_json",
            Self::FrameTooLarge(_) => "frame_too_large",
        }
    }

    /// Whether the reader can keep going after this error.
    ///
    /// Truncation desynchronizes the length-prefix stream; everything else
    /// is confined to one frame.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NotUtf8 | Self::MalformedJson(_) | Self::FrameTooLarge(_)
        )
    }
}

/// Read one frame and parse its JSON payload.
///
/// An oversize length prefix drains the payload from the stream before
/// returning [`FrameError::FrameTooLarge`], so the next read starts at a
/// frame boundary and the loop can continue.
pub async fn read_frame<R>(reader: &mut R) -> Result<serde_json::Value, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = read_length(reader).await?;

    if len > MAX_FRAME_LEN {
        drain(reader, len).await?;
        return Err(FrameError::FrameTooLarge(len));
    }

    let mut payload = vec![0_u8; len];
    let mut got = 0;
    while got < len {
        let n = reader
            .read(&mut payload[got..])
            .await
            .map_err(|_| FrameError::TruncatedPayload { want: len, got })?;
        if n == 0 {
            return Err(FrameError::TruncatedPayload { want: len, got });
        }
        got += n;
    }

    let text = std::str::from_utf8(&payload).map_err(|_| FrameError::NotUtf8)?;
    serde_json::from_str(text).map_err(|e| FrameError::MalformedJson(e.to_string()))
}

/// Serialize `msg` compactly and write it as one length-prefixed frame.
///
/// The length prefix and payload go out in a single buffered flush.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload =
        serde_json::to_vec(msg).map_err(|e| FrameError::MalformedJson(e.to_string()))?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }

    let len = u32::try_from(payload.len()).map_err(|_| FrameError::FrameTooLarge(payload.len()))?;

    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&payload);

    writer
        .write_all(&buf)
        .await
        .map_err(|_| FrameError::TruncatedPayload {
            want: buf.len(),
            got: 0,
        })?;
    writer
        .flush()
        .await
        .map_err(|_| FrameError::TruncatedPayload {
            want: buf.len(),
            got: 0,
        })?;
    Ok(())
}

/// Read the 4-byte little-endian length prefix.
///
/// Zero bytes read is a clean [`FrameError::Eof`]; a partial prefix is
/// [`FrameError::TruncatedLength`].
async fn read_length<R>(reader: &mut R) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0_u8; 4];
    let mut got = 0;
    while got < 4 {
        let n = reader
            .read(&mut prefix[got..])
            .await
            .map_err(|_| FrameError::TruncatedLength)?;
        if n == 0 {
            if got == 0 {
                return Err(FrameError::Eof);
            }
            return Err(FrameError::TruncatedLength);
        }
        got += n;
    }
    Ok(u32::from_le_bytes(prefix) as usize)
}

/// Discard exactly `len` payload bytes from the stream.
async fn drain<R>(reader: &mut R, len: usize) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut remaining = len;
    let mut scratch = [0_u8; 8192];
    while remaining > 0 {
        let chunk = remaining.min(scratch.len());
        let n = reader
            .read(&mut scratch[..chunk])
            .await
            .map_err(|_| FrameError::TruncatedPayload {
                want: len,
                got: len - remaining,
            })?;
        if n == 0 {
            return Err(FrameError::TruncatedPayload {
                want: len,
                got: len - remaining,
            });
        }
        remaining -= n;
    }
    Ok(())
}

//! Frame encoding for stream transports
//!
//! # Wire Format
//!
//! ```text
//! [len: u32 big-endian][payload: JSON-encoded Message]
//! ```
//!
//! `len` counts payload bytes only and is capped at [`MAX_FRAME_LEN`].

use crate::message::Message;
use canopy_core::LockError;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload: 16 MiB
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    /// Payload length above [`MAX_FRAME_LEN`]
    #[error("Frame of {0} bytes exceeds limit of {max}", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    /// Payload is not a valid message
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stream failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<CodecError> for LockError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Json(e) => LockError::Serialization(e.to_string()),
            other => LockError::Transport(other.to_string()),
        }
    }
}

/// Encode a message as one frame
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CodecError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Write one message frame and flush
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message frame
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

use std::io::{ErrorKind, Write};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bumped whenever the frame layout or [`ProgressRecord`] fields change.
pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 5;

/// One folder's outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub library_id: u32,
    pub file_count: u32,
    pub last_path: String,
    pub phase: String,
    pub error: Option<String>,
}

impl ProgressRecord {
    pub fn folder(library_id: u32, file_count: u32, last_path: impl Into<String>) -> Self {
        Self {
            library_id,
            file_count,
            last_path: last_path.into(),
            phase: "folders".to_string(),
            error: None,
        }
    }

    pub fn failure(
        library_id: u32,
        last_path: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            library_id,
            file_count: 0,
            last_path: last_path.into(),
            phase: "folders".to_string(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(std::io::Error),
    Encode(Box<bincode::ErrorKind>),
    UnsupportedVersion(u8),
    FrameTooLarge(usize),
    Truncated,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(err) => write!(f, "io error: {}", err),
            ProtocolError::Encode(err) => write!(f, "encoding error: {}", err),
            ProtocolError::UnsupportedVersion(version) => {
                write!(f, "unsupported progress frame version {}", version)
            }
            ProtocolError::FrameTooLarge(len) => {
                write!(f, "progress frame too large: {} bytes", len)
            }
            ProtocolError::Truncated => write!(f, "progress stream ended mid-frame"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(err)
        }
    }
}

impl From<Box<bincode::ErrorKind>> for ProtocolError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ProtocolError::Encode(err)
    }
}

/// Writes `[version u8][len u32 LE][bincode payload]` and flushes.
pub fn write_record<W: Write>(out: &mut W, record: &ProgressRecord) -> Result<(), ProtocolError> {
    let payload = bincode::serialize(record)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(PROTOCOL_VERSION);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    out.write_all(&buf)?;
    out.flush()?;
    Ok(())
}

/// Reads the next frame. `Ok(None)` only on a clean end of stream between frames.
pub async fn read_record<R: AsyncRead + Unpin>(
    input: &mut R,
) -> Result<Option<ProgressRecord>, ProtocolError> {
    let mut version = [0u8; 1];
    if input.read(&mut version).await? == 0 {
        return Ok(None);
    }
    if version[0] != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version[0]));
    }
    let mut len_buf = [0u8; 4];
    input.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

//! Binary envelope for boundary requests and responses.
//!
//! # Wire Format
//!
//! ```text
//! request:  [u32 BE frame_len][u8 method_len][method][body]
//! response: [u32 BE frame_len][body]
//! ```
//!
//! `frame_len` counts the bytes after the length prefix. Frames larger than
//! [`MAX_FRAME_LEN`] are rejected before any allocation. A connection that
//! closes cleanly between frames reads as `None`; closing inside a frame is
//! an error.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Largest accepted frame, excluding the length prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Longest method name that fits the one-byte length field.
pub const MAX_METHOD_LEN: usize = u8::MAX as usize;

type FrameResult<T> = std::result::Result<T, ProtocolError>;

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Method name.
    pub method: String,
    /// Raw request body.
    pub body: Vec<u8>,
}

/// Reads one request, or `None` on a clean end of stream.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`], [`ProtocolError::InvalidFrame`]
/// for a bad method header or truncated frame, and [`ProtocolError::Io`]
/// for I/O failures.
pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> FrameResult<Option<Request>> {
    let Some(payload) = read_frame(reader).await? else {
        return Ok(None);
    };

    let (&method_len, rest) = payload.split_first().ok_or_else(|| invalid("empty request frame"))?;
    let method_len = usize::from(method_len);
    if method_len == 0 {
        return Err(invalid("empty method name"));
    }
    if method_len > rest.len() {
        return Err(invalid(format!(
            "method length {method_len} exceeds remaining {} bytes",
            rest.len()
        )));
    }

    let (method, body) = rest.split_at(method_len);
    let method = std::str::from_utf8(method)
        .map_err(|_| invalid("method name is not UTF-8"))?
        .to_string();

    Ok(Some(Request {
        method,
        body: body.to_vec(),
    }))
}

/// Writes one request frame.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidFrame`] for an empty or over-long method
/// name, [`ProtocolError::FrameTooLarge`] for an oversized body and
/// [`ProtocolError::Io`] for I/O failures.
pub async fn write_request<W: AsyncWrite + Unpin>(
    writer: &mut W,
    method: &str,
    body: &[u8],
) -> FrameResult<()> {
    if method.is_empty() || method.len() > MAX_METHOD_LEN {
        return Err(invalid(format!("method name must be 1..={MAX_METHOD_LEN} bytes")));
    }

    let len = 1 + method.len() + body.len();
    let prefix = length_prefix(len)?;
    let method_len = u8::try_from(method.len()).map_err(|_| invalid("method name too long"))?;

    writer.write_all(&prefix).await?;
    writer.write_all(&[method_len]).await?;
    writer.write_all(method.as_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one response body, or `None` on a clean end of stream.
///
/// # Errors
///
/// Same as [`read_request`].
pub async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> FrameResult<Option<Vec<u8>>> {
    read_frame(reader).await
}

/// Writes one response frame.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] for an oversized body and
/// [`ProtocolError::Io`] for I/O failures.
pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> FrameResult<()> {
    let prefix = length_prefix(body.len())?;
    writer.write_all(&prefix).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> FrameResult<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(invalid("stream ended inside length prefix"));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            invalid(format!("stream ended inside {len} byte frame"))
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

fn length_prefix(len: usize) -> FrameResult<[u8; 4]> {
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    let len = u32::try_from(len).map_err(|_| invalid("frame length overflows u32"))?;
    Ok(len.to_be_bytes())
}

fn invalid(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidFrame {
        reason: reason.into(),
    }
}

//! IPC wire frame codec.
//!
//! # Frame Format
//!
//! Little-endian, fixed header followed by the payload:
//!
//! ```text
//! message_id (u64) | method_id (u32) | kind (u8) | payload_len (u32) | payload
//! ```
//!
//! `message_id` comes from a process-wide monotone counter; a response
//! echoes the id of its request. Error frames carry a `u16` code followed
//! by a UTF-8 reason.

use crate::constants::{FRAME_HEADER_LEN, MAX_ERROR_REASON_LEN, MAX_FRAME_PAYLOAD};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// =============================================================================
// Identifiers
// =============================================================================

static LAST_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);
static LAST_PEER_ID: AtomicU64 = AtomicU64::new(0);

/// Returns the next process-wide unique message id (starts at 1).
#[must_use]
pub fn next_message_id() -> u64 {
    LAST_MESSAGE_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Returns the next process-wide unique peer id (starts at 1).
#[must_use]
pub fn next_peer_id() -> u64 {
    LAST_PEER_ID.fetch_add(1, Ordering::Relaxed) + 1
}

// =============================================================================
// Error Codes
// =============================================================================

/// The service was stopped while the call was outstanding.
pub const ERR_SERVICE_STOPPED: u16 = 1;

/// The peer disconnected while the call was outstanding.
pub const ERR_PEER_DISCONNECTED: u16 = 2;

/// The call timed out.
pub const ERR_TIMED_OUT: u16 = 3;

/// The remote handler failed or panicked.
pub const ERR_HANDLER_ERROR: u16 = 4;

/// No handler is registered for the method.
pub const ERR_NO_SUCH_METHOD: u16 = 5;

// =============================================================================
// Frame Kind
// =============================================================================

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Method call expecting a response.
    Request = 0,
    /// Response paired to a request by message id.
    Response = 1,
    /// One-way notification; never answered.
    Signal = 2,
    /// Error response paired to a request by message id.
    Error = 3,
}

impl FrameKind {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Signal),
            3 => Ok(FrameKind::Error),
            other => Err(Error::Framing(format!("unknown frame kind {other}"))),
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

/// One wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Pairing id; responses echo the request's id.
    pub message_id: u64,
    /// API-dependent method id.
    pub method_id: u32,
    /// Frame discriminator.
    pub kind: FrameKind,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds a request frame with a fresh message id.
    #[must_use]
    pub fn request(method_id: u32, payload: Vec<u8>) -> Self {
        Self {
            message_id: next_message_id(),
            method_id,
            kind: FrameKind::Request,
            payload,
        }
    }

    /// Builds a response echoing the request's ids.
    #[must_use]
    pub fn response(message_id: u64, method_id: u32, payload: Vec<u8>) -> Self {
        Self {
            message_id,
            method_id,
            kind: FrameKind::Response,
            payload,
        }
    }

    /// Builds a signal frame with a fresh message id.
    #[must_use]
    pub fn signal(method_id: u32, payload: Vec<u8>) -> Self {
        Self {
            message_id: next_message_id(),
            method_id,
            kind: FrameKind::Signal,
            payload,
        }
    }

    /// Builds an error frame echoing the request's ids. The reason is
    /// truncated to `MAX_ERROR_REASON_LEN` bytes on a char boundary.
    #[must_use]
    pub fn error(message_id: u64, method_id: u32, code: u16, reason: &str) -> Self {
        let mut reason = reason;
        while reason.len() > MAX_ERROR_REASON_LEN {
            let mut cut = MAX_ERROR_REASON_LEN;
            while !reason.is_char_boundary(cut) {
                cut -= 1;
            }
            reason = &reason[..cut];
        }
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_le_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self {
            message_id,
            method_id,
            kind: FrameKind::Error,
            payload,
        }
    }

    /// Decodes the `(code, reason)` pair of an error frame.
    ///
    /// # Errors
    ///
    /// Returns `Error::Framing` if the frame is not an error frame or the
    /// payload is truncated or not UTF-8.
    pub fn error_payload(&self) -> Result<(u16, String)> {
        if self.kind != FrameKind::Error {
            return Err(Error::Framing("not an error frame".to_string()));
        }
        if self.payload.len() < 2 {
            return Err(Error::Framing("error payload truncated".to_string()));
        }
        let code = u16::from_le_bytes([self.payload[0], self.payload[1]]);
        let reason = std::str::from_utf8(&self.payload[2..])
            .map_err(|e| Error::Framing(format!("error reason not UTF-8: {e}")))?
            .to_string();
        Ok((code, reason))
    }

    /// Encodes the frame into a byte vector.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.message_id.to_le_bytes());
        buf.extend_from_slice(&self.method_id.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decodes one frame from a complete buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::Framing` for truncated buffers, unknown kinds,
    /// oversized payloads, or trailing bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(Error::Framing(format!(
                "buffer too short for header: {} < {FRAME_HEADER_LEN}",
                buf.len()
            )));
        }
        let message_id = u64::from_le_bytes(buf[0..8].try_into().expect("sized slice"));
        let method_id = u32::from_le_bytes(buf[8..12].try_into().expect("sized slice"));
        let kind = FrameKind::from_u8(buf[12])?;
        let payload_len =
            u32::from_le_bytes(buf[13..17].try_into().expect("sized slice")) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(Error::Framing(format!(
                "payload length {payload_len} exceeds {MAX_FRAME_PAYLOAD}"
            )));
        }
        if buf.len() != FRAME_HEADER_LEN + payload_len {
            return Err(Error::Framing(format!(
                "buffer length {} does not match header ({})",
                buf.len(),
                FRAME_HEADER_LEN + payload_len
            )));
        }
        Ok(Self {
            message_id,
            method_id,
            kind,
            payload: buf[FRAME_HEADER_LEN..].to_vec(),
        })
    }

    /// Reads one frame from an async stream. Short reads are retried by
    /// `read_exact`; EOF mid-frame is a framing error, EOF on the frame
    /// boundary surfaces as `UnexpectedEof` from the first read.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await?;

        let message_id = u64::from_le_bytes(header[0..8].try_into().expect("sized slice"));
        let method_id = u32::from_le_bytes(header[8..12].try_into().expect("sized slice"));
        let kind = FrameKind::from_u8(header[12])?;
        let payload_len =
            u32::from_le_bytes(header[13..17].try_into().expect("sized slice")) as usize;
        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(Error::Framing(format!(
                "payload length {payload_len} exceeds {MAX_FRAME_PAYLOAD}"
            )));
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            message_id,
            method_id,
            kind,
            payload,
        })
    }

    /// Writes the frame to an async stream and flushes.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let frame = Frame {
            message_id: 42,
            method_id: 7,
            kind: FrameKind::Request,
            payload: b"{\"id\":\"z1\"}".to_vec(),
        };
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let frame = Frame::signal(9, Vec::new());
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_error_payload_roundtrip() {
        let frame = Frame::error(3, 5, ERR_HANDLER_ERROR, "boom");
        let (code, reason) = frame.error_payload().unwrap();
        assert_eq!(code, ERR_HANDLER_ERROR);
        assert_eq!(reason, "boom");
    }

    #[test]
    fn test_decode_rejects_truncated_header() {
        assert!(Frame::decode(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_kind() {
        let mut buf = Frame::request(1, vec![]).encode();
        buf[12] = 99;
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_payload() {
        let mut buf = Frame::request(1, vec![]).encode();
        let bogus = (MAX_FRAME_PAYLOAD as u32 + 1).to_le_bytes();
        buf[13..17].copy_from_slice(&bogus);
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut buf = Frame::request(1, b"x".to_vec()).encode();
        buf.push(0);
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_message_ids_are_monotone() {
        let a = next_message_id();
        let b = next_message_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_async_roundtrip() {
        let frame = Frame::request(11, b"payload".to_vec());
        let mut buf = Vec::new();
        frame.write_to(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Frame::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }
}

//! Replication Wire Protocol
//!
//! Defines the framed wire format spoken between the primary engine, the
//! secondary peer and socket gateway clients: an 8-byte header (length +
//! CRC32 of the body) followed by a bincode-encoded message. Bulk payloads
//! travel as raw bytes after the message that declares their length, so
//! request data is never copied through the serializer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Largest accepted frame body. Frames carry headers only; payloads are
/// transferred separately, so this bounds handshake dirty-map images.
pub const MAX_FRAME: u32 = 4 * 1024 * 1024;

/// Gateway operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Read a byte span
    Read,
    /// Write a byte span
    Write,
    /// Discard a byte span (zero-fill on file-backed components)
    Delete,
    /// Flush the component to stable storage
    Flush,
}

impl Command {
    /// Short name for request logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::Read => "READ",
            Command::Write => "WRITE",
            Command::Delete => "DELETE",
            Command::Flush => "FLUSH",
        }
    }
}

/// Completion status, the closed error set surfaced to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpStatus {
    /// Operation succeeded
    Ok = 0,
    /// Component I/O failure
    IoError = 1,
    /// Remote component unreachable
    NotConnected = 2,
    /// Not attempted, or the request itself was malformed
    Invalid = 3,
}

impl OpStatus {
    /// Decode from the atomic error-slot representation
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => OpStatus::Ok,
            1 => OpStatus::IoError,
            2 => OpStatus::NotConnected,
            _ => OpStatus::Invalid,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, OpStatus::Ok)
    }
}

/// Protocol messages exchanged between nodes and gateway clients
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// First handshake step, sent by the connecting primary
    HandshakeRequest {
        resource: String,
        token: Vec<u8>,
        resource_id: Option<Uuid>,
        local_gen: u64,
        peer_gen: u64,
        media_size: u64,
        extent_size: u64,
    },

    /// Second handshake step, sent by the accepting secondary. A non-empty
    /// `dirty_map` carries the secondary's packed dirty-extent image for the
    /// primary to merge.
    HandshakeResponse {
        token: Vec<u8>,
        resource_id: Uuid,
        local_gen: u64,
        peer_gen: u64,
        media_size: u64,
        extent_size: u64,
        dirty_map: Option<Vec<u8>>,
        error: Option<String>,
    },

    /// One I/O request. A `Write` is followed by `length` raw payload bytes.
    Request {
        seq: u64,
        cmd: Command,
        offset: u64,
        length: u64,
    },

    /// Reply to a request. A successful `Read` reply is followed by
    /// `length` raw payload bytes.
    Reply {
        seq: u64,
        status: OpStatus,
        length: u64,
    },

    /// Resynchronization finished; the receiver records the sender's data
    /// generation as fully replicated and persists its counters.
    SyncDone { local_gen: u64 },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::HandshakeRequest { .. } => "HandshakeRequest",
            Message::HandshakeResponse { .. } => "HandshakeResponse",
            Message::Request { .. } => "Request",
            Message::Reply { .. } => "Reply",
            Message::SyncDone { .. } => "SyncDone",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header for a body
    pub fn new(body: &[u8]) -> Self {
        Self {
            length: body.len() as u32,
            checksum: crc32fast::hash(body),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut length = [0u8; 4];
        let mut checksum = [0u8; 4];
        length.copy_from_slice(&bytes[0..4]);
        checksum.copy_from_slice(&bytes[4..8]);
        Self {
            length: u32::from_le_bytes(length),
            checksum: u32::from_le_bytes(checksum),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME {
        return Err(Error::Protocol(format!(
            "frame body of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Protocol("frame checksum mismatch".into()));
    }

    Message::deserialize(&body)
}

/// Write a framed message to a writer, optionally followed by a raw payload
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
    payload: Option<&[u8]>,
) -> Result<()> {
    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    if let Some(payload) = payload {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a raw payload of `length` bytes into the front of `buf`
pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
    length: u64,
) -> Result<()> {
    let length = length as usize;
    if length > buf.len() {
        return Err(Error::Protocol(format!(
            "payload of {} bytes exceeds buffer of {}",
            length,
            buf.len()
        )));
    }
    reader.read_exact(&mut buf[..length]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_message_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let msg = Message::Request {
            seq: 7,
            cmd: Command::Write,
            offset: 4096,
            length: 5,
        };

        write_message(&mut client, &msg, Some(b"hello")).await.unwrap();

        let restored = read_message(&mut server).await.unwrap();
        match restored {
            Message::Request { seq, cmd, offset, length } => {
                assert_eq!(seq, 7);
                assert_eq!(cmd, Command::Write);
                assert_eq!(offset, 4096);
                assert_eq!(length, 5);
            }
            other => panic!("wrong message type: {}", other.type_name()),
        }

        let mut buf = [0u8; 16];
        read_payload(&mut server, &mut buf, 5).await.unwrap();
        assert_eq!(&buf[..5], b"hello");
    }

    #[tokio::test]
    async fn test_corrupt_frame_rejected() {
        let msg = Message::SyncDone { local_gen: 3 };
        let body = msg.serialize().unwrap();
        let header = FrameHeader::new(&body);

        let mut wire = Vec::new();
        wire.extend_from_slice(&header.to_bytes());
        wire.extend_from_slice(&body);
        // Flip one body bit.
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut reader = std::io::Cursor::new(wire);
        let err = read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_frame_header_round_trip() {
        let header = FrameHeader::new(b"some body");
        let restored = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(header.length, restored.length);
        assert_eq!(header.checksum, restored.checksum);
    }

    #[test]
    fn test_status_from_u8() {
        assert_eq!(OpStatus::from_u8(0), OpStatus::Ok);
        assert_eq!(OpStatus::from_u8(2), OpStatus::NotConnected);
        assert_eq!(OpStatus::from_u8(42), OpStatus::Invalid);
    }
}

//! Broker Protocol
//!
//! Wire protocol between nodes and the coordination broker:
//! length-prefixed, CRC32-checked, bincode-encoded frames.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Largest frame body accepted from the wire
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Protocol messages between nodes and the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    // ========== Locks ==========
    /// Set the lease if absent or expired
    Acquire {
        key: String,
        token: String,
        ttl_ms: u64,
    },

    /// Push the expiry of a lease still owned by `token`
    Extend {
        key: String,
        token: String,
        ttl_ms: u64,
    },

    /// Delete the lease if owned by `token`
    Release { key: String, token: String },

    /// Outcome of a lock operation
    LockResponse { granted: bool },

    // ========== Pub/Sub ==========
    /// Publish to every current subscriber of a channel
    Publish { channel: String, payload: Vec<u8> },

    /// Number of subscribers the message was handed to
    Published { receivers: usize },

    /// Turn this connection into a delivery stream for `channel`
    Subscribe { channel: String },

    /// Subscription accepted
    Subscribed { channel: String },

    /// Message pushed to a subscriber
    Delivery { channel: String, payload: Vec<u8> },

    // ========== Health ==========
    Ping,

    Pong,

    // ========== Error ==========
    /// Error response
    Error { message: String },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Acquire { .. } => "Acquire",
            Message::Extend { .. } => "Extend",
            Message::Release { .. } => "Release",
            Message::LockResponse { .. } => "LockResponse",
            Message::Publish { .. } => "Publish",
            Message::Published { .. } => "Published",
            Message::Subscribe { .. } => "Subscribe",
            Message::Subscribed { .. } => "Subscribed",
            Message::Delivery { .. } => "Delivery",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Error { .. } => "Error",
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
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
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_SIZE {
        return Err(Error::FrameTooLarge(header.length));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    Ok(Message::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

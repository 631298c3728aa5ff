//! Replication Module
//!
//! Mutation events broadcast on the bus and applied by every node to
//! its local record store. Delivery is at most once and unordered;
//! applying the same event again is harmless and the last applied
//! event for an id wins.

mod bus;
mod apply;

pub use bus::{EventHandler, MutationBus};
pub use apply::Replicator;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Record;

/// What happened to the record. Both kinds are applied the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    Created,
    Updated,
}

impl MutationKind {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Created => "CREATED",
            MutationKind::Updated => "UPDATED",
        }
    }

    /// Parse a wire name
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATED" => Some(MutationKind::Created),
            "UPDATED" => Some(MutationKind::Updated),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record change broadcast for replication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent<R> {
    pub payload: R,
    pub kind: MutationKind,
}

impl<R: Record> MutationEvent<R> {
    pub fn created(payload: R) -> Self {
        Self {
            payload,
            kind: MutationKind::Created,
        }
    }

    pub fn updated(payload: R) -> Self {
        Self {
            payload,
            kind: MutationKind::Updated,
        }
    }

    /// Encode as the JSON envelope carried on the bus
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode a bus envelope, separating malformed bytes from unknown kinds
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
        let kind = MutationKind::parse(&raw.kind).ok_or(DecodeError::UnknownKind(raw.kind))?;
        let payload = serde_json::from_value(raw.payload).map_err(DecodeError::InvalidPayload)?;
        Ok(Self { payload, kind })
    }
}

/// Envelope as it appears on the wire, before the kind is checked
#[derive(Deserialize)]
struct RawEnvelope {
    payload: serde_json::Value,
    kind: String,
}

/// Why an incoming bus message was dropped
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(serde_json::Error),

    #[error("unknown mutation kind {0:?}")]
    UnknownKind(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(serde_json::Error),
}

//! Coordination Module
//!
//! The two external primitives the replication core relies on: an
//! expiring mutual-exclusion lock and a fire-and-forget pub/sub
//! channel. Backends are an in-process hub (single node, tests) and a
//! shared TCP broker.

mod lease;
mod hub;
mod memory;
mod broker;
mod remote;
pub mod protocol;

pub use lease::LeaseTable;
pub use hub::ChannelHub;
pub use memory::{MemoryClient, MemoryCoordinator};
pub use broker::BrokerServer;
pub use remote::RemoteCoordinator;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Expiring named lock. Implementations must make `acquire` atomic
/// across every process sharing the service.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Take `key` for `token` if it is free or expired
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Extend `key` if it is still owned by `token`
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it is owned by `token`
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

/// Fire-and-forget publish/subscribe. Delivery is at most once, only
/// to subscribers connected at publish time, with no ordering across
/// publishers.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload`, returning how many subscribers it was handed to
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;

    /// Open a subscription on `channel`
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Stream of raw messages received on a channel
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next message; `None` once the subscription is closed
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next message if one is already queued
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

/// TTL in milliseconds for the wire, never zero
pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

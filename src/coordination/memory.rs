//! In-process coordination backend
//!
//! A lease table and channel hub shared by every client created from
//! the same `MemoryCoordinator`. Each client can be switched offline to
//! simulate losing the coordination service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{ChannelHub, LeaseTable, LockService, PubSub, Subscription};
use crate::error::{Error, Result};

/// Shared in-process coordination service
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    leases: Mutex<LeaseTable>,
    hub: ChannelHub,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a client handle, initially online
    pub fn client(self: &Arc<Self>) -> MemoryClient {
        MemoryClient {
            shared: Arc::clone(self),
            online: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Token currently holding `key`
    pub async fn holder(&self, key: &str) -> Option<String> {
        self.leases
            .lock()
            .await
            .holder(key, Instant::now())
            .map(str::to_string)
    }
}

/// Client view of a `MemoryCoordinator`
#[derive(Debug, Clone)]
pub struct MemoryClient {
    shared: Arc<MemoryCoordinator>,
    online: Arc<AtomicBool>,
}

impl MemoryClient {
    /// Simulate losing or regaining the coordination service
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::Unavailable("coordination service unreachable".into()))
        }
    }
}

#[async_trait]
impl LockService for MemoryClient {
    async fn acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let mut leases = self.shared.leases.lock().await;
        Ok(leases.acquire(key, token, ttl, Instant::now()))
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.check_online()?;
        let mut leases = self.shared.leases.lock().await;
        Ok(leases.extend(key, token, ttl, Instant::now()))
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        self.check_online()?;
        self.shared.leases.lock().await.release(key, token);
        Ok(())
    }
}

#[async_trait]
impl PubSub for MemoryClient {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize> {
        self.check_online()?;
        Ok(self.shared.hub.publish(channel, &payload).await)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.check_online()?;
        // Messages published while offline are lost, like a dropped connection
        Ok(self
            .shared
            .hub
            .subscribe_gated(channel, Arc::clone(&self.online))
            .await)
    }
}

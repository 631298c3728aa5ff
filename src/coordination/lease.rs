//! Lease Table
//!
//! Expiring, token-owned leases. Callers hold the table behind a single
//! lock, which is what makes acquire atomic.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct LeaseEntry {
    token: String,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Set of named leases
#[derive(Debug, Default)]
pub struct LeaseTable {
    leases: HashMap<String, LeaseEntry>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `key` to `token` if nobody holds a live lease on it
    pub fn acquire(&mut self, key: &str, token: &str, ttl: Duration, now: Instant) -> bool {
        if let Some(entry) = self.leases.get(key) {
            if entry.is_live(now) {
                return false;
            }
        }

        self.leases.insert(
            key.to_string(),
            LeaseEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Extend a live lease owned by `token`. Expired leases cannot be revived.
    pub fn extend(&mut self, key: &str, token: &str, ttl: Duration, now: Instant) -> bool {
        match self.leases.get_mut(key) {
            Some(entry) if entry.token == token && entry.is_live(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// Delete the lease if owned by `token`
    pub fn release(&mut self, key: &str, token: &str) -> bool {
        match self.leases.get(key) {
            Some(entry) if entry.token == token => {
                self.leases.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Current live holder of `key`
    pub fn holder(&self, key: &str, now: Instant) -> Option<&str> {
        self.leases
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.token.as_str())
    }

    /// Drop expired leases
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, entry| entry.is_live(now));
        before - self.leases.len()
    }
}

//! Channel Hub
//!
//! Fan-out of published messages to the subscribers connected at
//! publish time. Nothing is buffered for absent subscribers and a
//! subscriber whose queue is full loses the message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::Subscription;

/// Per-subscriber queue depth
pub const SUBSCRIBER_QUEUE: usize = 1024;

#[derive(Debug)]
struct Subscriber {
    tx: mpsc::Sender<Vec<u8>>,
    /// Deliveries are skipped while the gate is closed
    gate: Option<Arc<AtomicBool>>,
}

impl Subscriber {
    fn is_reachable(&self) -> bool {
        self.gate.as_ref().map_or(true, |g| g.load(Ordering::SeqCst))
    }
}

/// In-process pub/sub fan-out
#[derive(Debug, Default)]
pub struct ChannelHub {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber on `channel`
    pub async fn subscribe(&self, channel: &str) -> Subscription {
        self.register(channel, None).await
    }

    /// Register a subscriber that only receives while `gate` is set
    pub async fn subscribe_gated(&self, channel: &str, gate: Arc<AtomicBool>) -> Subscription {
        self.register(channel, Some(gate)).await
    }

    async fn register(&self, channel: &str, gate: Option<Arc<AtomicBool>>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.channels
            .lock()
            .await
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { tx, gate });
        Subscription::new(rx)
    }

    /// Hand `payload` to every live subscriber; returns how many received it
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        let mut channels = self.channels.lock().await;
        let Some(subscribers) = channels.get_mut(channel) else {
            return 0;
        };

        let mut delivered = 0;
        subscribers.retain(|sub| {
            if !sub.is_reachable() {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(payload.to_vec()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("Subscriber queue full on {}, message dropped", channel);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        if subscribers.is_empty() {
            channels.remove(channel);
        }

        delivered
    }

    /// Number of live subscribers on `channel`
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .await
            .get(channel)
            .map_or(0, |subs| subs.iter().filter(|sub| !sub.tx.is_closed()).count())
    }
}

//! Mutation Bus
//!
//! One pub/sub channel per environment. Publishing is fire-and-forget:
//! no acknowledgement, no retry, nothing kept for subscribers that are
//! not connected. Subscribing runs a task that decodes every message
//! and hands recognised events to a handler.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::{DecodeError, MutationEvent};
use crate::coordination::PubSub;
use crate::error::Result;
use crate::model::Record;
use crate::shutdown::{self, ShutdownSignal};

/// Receiver of decoded mutation events
#[async_trait]
pub trait EventHandler<R>: Send + Sync {
    async fn handle(&self, event: MutationEvent<R>);
}

/// Environment-scoped mutation channel
pub struct MutationBus<R> {
    pubsub: Arc<dyn PubSub>,
    channel: String,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> MutationBus<R> {
    pub fn new(pubsub: Arc<dyn PubSub>, channel: String) -> Self {
        Self {
            pubsub,
            channel,
            _record: PhantomData,
        }
    }

    /// Broadcast an event. Failures are logged and the event is lost.
    pub async fn publish(&self, event: &MutationEvent<R>) {
        let id = event.payload.id().to_string();
        let bytes = match event.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode {} event for {}: {}", event.kind, id, e);
                return;
            }
        };

        match self.pubsub.publish(&self.channel, bytes).await {
            Ok(receivers) => {
                tracing::debug!(
                    "Published {} for {} to {} subscriber(s)",
                    event.kind,
                    id,
                    receivers
                );
            }
            Err(e) => {
                tracing::warn!("Failed to publish {} for {}, event dropped: {}", event.kind, id, e);
            }
        }
    }

    /// Subscribe `handler` to the channel until shutdown. Only failing to
    /// open the subscription is an error.
    pub async fn subscribe(
        &self,
        handler: Arc<dyn EventHandler<R>>,
        mut shutdown: ShutdownSignal,
    ) -> Result<JoinHandle<()>> {
        let mut subscription = self.pubsub.subscribe(&self.channel).await?;
        let channel = self.channel.clone();
        tracing::info!("Listening for mutations on {}", channel);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = subscription.next() => {
                        let Some(bytes) = message else {
                            tracing::warn!("Subscription to {} closed", channel);
                            break;
                        };
                        dispatch(&bytes, handler.as_ref()).await;
                    }
                    _ = shutdown::requested(&mut shutdown) => break,
                }
            }
            tracing::info!("Mutation listener on {} stopped", channel);
        }))
    }
}

/// Decode one raw message and forward it. Returns true if the handler ran.
pub(crate) async fn dispatch<R: Record>(bytes: &[u8], handler: &dyn EventHandler<R>) -> bool {
    match MutationEvent::<R>::decode(bytes) {
        Ok(event) => {
            handler.handle(event).await;
            true
        }
        Err(DecodeError::UnknownKind(kind)) => {
            tracing::warn!("Received unknown mutation kind: {}", kind);
            false
        }
        Err(e) => {
            tracing::error!("Dropping bus message: {}", e);
            false
        }
    }
}

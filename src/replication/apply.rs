//! Replication apply loop
//!
//! Writes every received event through the local record store,
//! overwriting whatever copy is there.

use async_trait::async_trait;

use super::{EventHandler, MutationEvent};
use crate::model::Record;
use crate::store::RecordStore;

/// Applies mutation events to the local store
pub struct Replicator<R> {
    store: RecordStore<R>,
}

impl<R: Record> Replicator<R> {
    pub fn new(store: RecordStore<R>) -> Self {
        Self { store }
    }

    /// Overwrite the local copy with the event payload. A failed write
    /// leaves this node diverged until the next mutation of the same id.
    async fn apply(&self, event: MutationEvent<R>) {
        let id = event.payload.id().to_string();
        tracing::debug!("Applying {} for {}", event.kind, id);

        if !self.store.save_record(&event.payload).await {
            tracing::error!(
                "Failed to apply {} for {}; local copy is stale until the next mutation",
                event.kind,
                id
            );
        }
    }
}

#[async_trait]
impl<R: Record> EventHandler<R> for Replicator<R> {
    async fn handle(&self, event: MutationEvent<R>) {
        self.apply(event).await;
    }
}

//! Shutdown signalling
//!
//! Background loops take a `watch::Receiver<bool>`; flipping the sender
//! to `true` (or dropping it) stops them.

use tokio::sync::watch;

/// Sending half held by the process owner
pub type ShutdownTrigger = watch::Sender<bool>;

/// Receiving half handed to background loops
pub type ShutdownSignal = watch::Receiver<bool>;

/// Create a new trigger/signal pair
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    watch::channel(false)
}

/// Resolve once shutdown has been requested or the trigger is gone
pub async fn requested(signal: &mut ShutdownSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Non-blocking check
pub fn is_requested(signal: &ShutdownSignal) -> bool {
    *signal.borrow()
}

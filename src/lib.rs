//! Coasters - Replicated Coaster Registry
//!
//! Every node keeps its own file-backed copy of the coaster records and
//! converges with the rest of the fleet over a best-effort mutation bus.
//! One node at a time holds an expiring leadership lease and prints the
//! periodic status report.
//!
//! # Architecture
//!
//! - Writes arrive over HTTP, are saved to the local store, then
//!   published on the environment's channel
//! - Every node, the writer included, applies received events by
//!   overwriting its local copy (last applied wins)
//! - The lock coordinator acquires, renews and re-acquires the lease;
//!   the reporter only runs while this node leads
//! - Locks and pub/sub come from an in-process hub or a shared TCP broker
//!
//! Delivery is at most once: a node that is disconnected when an event
//! is published stays stale until that record changes again.

pub mod api;
pub mod config;
pub mod coordination;
pub mod error;
pub mod model;
pub mod replication;
pub mod reporter;
pub mod shutdown;
pub mod state;
pub mod store;

pub use config::CoastersConfig;
pub use error::{Error, Result};

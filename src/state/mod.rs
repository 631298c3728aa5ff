//! State Management Module
//!
//! Leadership state of this node: the lease-holding lock coordinator
//! and the read-only view other components gate on.

mod lock;

pub use lock::{LeaderRole, LeaseConfig, Leadership, LeadershipWatch, LockCoordinator};

//! Record Model
//!
//! The replication core treats records as opaque documents with a
//! stable string id. Coasters and their wagons are the concrete
//! record type served by this node.

mod coaster;
mod validation;

pub use coaster::{CapacityDelta, Coaster, CoasterStatus, StaffingDelta, Wagon};
pub use validation::{validate_coaster, validate_wagon, ValidationErrors};

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A replicated record: serializable, identified by an immutable id
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Unique record id
    fn id(&self) -> &str;
}

/// A record that can render its own block in the status report
pub trait StatusReport {
    /// Render a human-readable status block
    fn status_block(&self) -> String;
}

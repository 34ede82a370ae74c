//! Status store and event bus for Orca.
//!
//! Every state transition of an action, move, method, labware thread, or
//! workflow is written through `StatusManager`, which keeps the latest
//! `StatusRecord` per entity id and fans the change out on the `EventBus`
//! under both `KIND.STATUS` and `KIND.id.STATUS` names.

pub mod events;
pub mod status;

pub use events::{Event, EventBus, SubscriptionId};
pub use status::{
    ActionStatus, LabwareThreadStatus, MethodStatus, Status, StatusKind, StatusManager,
    StatusRecord, WorkflowStatus,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("status store lock poisoned: {0}")]
    Poisoned(String),
}

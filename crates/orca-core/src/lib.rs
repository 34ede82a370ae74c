//! Reservation and routing core for Orca lab automation.
//!
//! This crate ties the schema, status store, and driver runtime together into
//! the `Engine`: the location graph (`SystemMap`), single-location
//! reservations and the batched `ReservationCoordinator` tick loop, wait-for
//! graph deadlock detection, move resolution with deadlock escape, resource
//! pool resolution, and the per-labware thread state machine that walks each
//! plate through its methods.

pub mod context;
pub mod coordinator;
pub mod deadlock;
pub mod engine;
pub mod lifecycle;
pub mod method;
pub mod moves;
pub mod reservation;
pub mod resolver;
pub mod system_map;
pub mod thread;

pub use context::{OrcaContext, SchedulerOptions};
pub use coordinator::{PendingReservation, ReservationCoordinator, TickLoop, TickReport};
pub use deadlock::{find_deadlocked, WaitForGraph};
pub use engine::{Engine, EngineBuilder, WorkflowRun};
pub use lifecycle::validate_transition;
pub use method::{ActionInstance, MethodInstance};
pub use moves::{ExecutingMoveAction, MoveAction, MoveHandler};
pub use reservation::{
    CollectionOutcome, LocationReservation, ReservationCollection, ReservationId,
    ReservationManager, ReservationState,
};
pub use resolver::{LocationAction, Resolution, ResourceActionResolver};
pub use system_map::{Hop, Location, Path, SystemMap};
pub use thread::LabwareThread;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] orca_schema::ConfigError),
    #[error("driver error: {0}")]
    Driver(#[from] orca_runtime::DriverError),
    #[error("status error: {0}")]
    Status(#[from] orca_store::StatusError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no path from '{from}' to '{to}'")]
    NoPath { from: String, to: String },
    #[error("thread {thread} gave up after {attempts} reservation attempts")]
    ReservationExhausted { thread: String, attempts: u32 },
    #[error("reservation coordinator is not running")]
    CoordinatorUnavailable,
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("action {action} errored")]
    ActionFailed { action: String },
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("thread {0} was stopped")]
    Stopped(String),
    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

//! Resource capabilities and drivers for Orca.
//!
//! This crate implements the driver boundary: the `Executable`, `Loadable`,
//! and `Transporter` capability traits, the `Capability` variant a resource
//! is classified into when it is registered, the `ResourceRegistry` that the
//! core looks resources up in, and mock drivers that simulate instruments and
//! robotic arms while enforcing their physical invariants.

pub mod capability;
pub mod driver;
pub mod mock;
pub mod registry;

pub use capability::{Capability, Executable, Instrument, Loadable, Transporter};
pub use driver::select_driver;
pub use mock::{MockInstrument, MockTransporter};
pub use registry::{ResourceRegistry, TransporterHandle};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver '{0}' is not available")]
    DriverUnavailable(String),
    #[error("unknown resource: {0}")]
    UnknownResource(String),
    #[error("resource '{0}' is registered more than once")]
    DuplicateResource(String),
    #[error("resource '{0}' is not initialized")]
    NotInitialized(String),
    #[error("resource '{0}' is busy")]
    Busy(String),
    #[error("labware '{labware}' is not loaded on '{resource}'")]
    LabwareNotLoaded { resource: String, labware: String },
    #[error("transporter '{transporter}' has no taught position '{location}'")]
    UntaughtPosition {
        transporter: String,
        location: String,
    },
    #[error("command failed on '{resource}': {reason}")]
    CommandFailed { resource: String, reason: String },
}

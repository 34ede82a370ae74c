use crate::DriverError;
use async_trait::async_trait;
use orca_schema::{ActionOptions, LabwareId, LocationName};
use std::sync::Arc;

/// Something that runs commands.
#[async_trait]
pub trait Executable: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<(), DriverError>;

    async fn execute(&self, command: &str, options: &ActionOptions) -> Result<(), DriverError>;

    fn is_running(&self) -> bool;

    fn is_initialized(&self) -> bool;
}

/// Something labware can be placed on and picked from.
#[async_trait]
pub trait Loadable: Send + Sync {
    async fn prepare_for_pick(&self, labware: &LabwareId) -> Result<(), DriverError>;

    async fn prepare_for_place(&self, labware: &LabwareId) -> Result<(), DriverError>;

    fn notify_picked(&self, labware: &LabwareId) -> Result<(), DriverError>;

    fn notify_placed(&self, labware: &LabwareId) -> Result<(), DriverError>;

    fn loaded_labware(&self) -> Vec<LabwareId>;
}

/// An instrument both executes commands and holds labware.
pub trait Instrument: Executable + Loadable {}

impl<T: Executable + Loadable + ?Sized> Instrument for T {}

/// A robotic arm carrying labware between its taught positions.
#[async_trait]
pub trait Transporter: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> Result<(), DriverError>;

    async fn pick(&self, location: &LocationName, labware: &LabwareId) -> Result<(), DriverError>;

    async fn place(&self, location: &LocationName, labware: &LabwareId)
        -> Result<(), DriverError>;

    fn taught_positions(&self) -> Vec<LocationName>;
}

/// Capability of a registered resource, decided once at registration.
#[derive(Clone)]
pub enum Capability {
    Instrument(Arc<dyn Instrument>),
    Transporter(Arc<dyn Transporter>),
}

impl Capability {
    pub fn name(&self) -> &str {
        match self {
            Capability::Instrument(i) => i.name(),
            Capability::Transporter(t) => t.name(),
        }
    }

    pub async fn initialize(&self) -> Result<(), DriverError> {
        match self {
            Capability::Instrument(i) => i.initialize().await,
            Capability::Transporter(t) => t.initialize().await,
        }
    }
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Instrument(i) => write!(f, "Instrument({})", i.name()),
            Capability::Transporter(t) => write!(f, "Transporter({})", t.name()),
        }
    }
}

use crate::capability::Capability;
use crate::mock::{MockInstrument, MockTransporter};
use crate::DriverError;
use orca_schema::{ResourceKind, ResourceSection};
use std::sync::Arc;
use std::time::Duration;

/// Build the driver named by a resource declaration.
pub fn select_driver(section: &ResourceSection) -> Result<Capability, DriverError> {
    let delay = Duration::from_millis(section.delay_ms);
    match (section.driver.as_str(), section.kind) {
        ("mock", ResourceKind::Instrument) => Ok(Capability::Instrument(Arc::new(
            MockInstrument::new(section.name.as_str()).with_delay(delay),
        ))),
        ("mock", ResourceKind::Transporter) => Ok(Capability::Transporter(Arc::new(
            MockTransporter::new(section.name.as_str(), section.positions.iter().cloned())
                .with_delay(delay),
        ))),
        (other, _) => Err(DriverError::DriverUnavailable(other.to_owned())),
    }
}

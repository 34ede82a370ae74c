use crate::capability::{Capability, Instrument, Transporter};
use crate::DriverError;
use orca_schema::ResourceName;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// A transporter plus the arm lock serializing its pick/place sequences.
pub struct TransporterHandle {
    driver: Arc<dyn Transporter>,
    arm: Mutex<()>,
}

impl TransporterHandle {
    pub fn new(driver: Arc<dyn Transporter>) -> Self {
        Self {
            driver,
            arm: Mutex::new(()),
        }
    }

    pub fn driver(&self) -> &Arc<dyn Transporter> {
        &self.driver
    }

    /// Wait until the arm is free; it stays reserved while the guard lives.
    pub async fn acquire(&self) -> MutexGuard<'_, ()> {
        self.arm.lock().await
    }
}

#[derive(Default)]
pub struct ResourceRegistry {
    instruments: BTreeMap<ResourceName, Arc<dyn Instrument>>,
    transporters: BTreeMap<ResourceName, Arc<TransporterHandle>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: Capability) -> Result<(), DriverError> {
        let name = ResourceName::new(capability.name());
        if self.contains(&name) {
            return Err(DriverError::DuplicateResource(name.to_string()));
        }
        debug!("registering {capability:?}");
        match capability {
            Capability::Instrument(i) => {
                self.instruments.insert(name, i);
            }
            Capability::Transporter(t) => {
                self.transporters
                    .insert(name, Arc::new(TransporterHandle::new(t)));
            }
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instruments.contains_key(name) || self.transporters.contains_key(name)
    }

    pub fn instrument(&self, name: &str) -> Result<Arc<dyn Instrument>, DriverError> {
        self.instruments
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownResource(name.to_owned()))
    }

    pub fn transporter(&self, name: &str) -> Result<Arc<TransporterHandle>, DriverError> {
        self.transporters
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::UnknownResource(name.to_owned()))
    }

    pub fn transporters(&self) -> impl Iterator<Item = (&ResourceName, &Arc<TransporterHandle>)> {
        self.transporters.iter()
    }

    pub fn instruments(&self) -> impl Iterator<Item = (&ResourceName, &Arc<dyn Instrument>)> {
        self.instruments.iter()
    }

    pub async fn initialize_all(&self) -> Result<(), DriverError> {
        for instrument in self.instruments.values() {
            instrument.initialize().await?;
        }
        for handle in self.transporters.values() {
            handle.driver().initialize().await?;
        }
        Ok(())
    }
}

use crate::capability::{Executable, Loadable, Transporter};
use crate::DriverError;
use async_trait::async_trait;
use orca_schema::{ActionOptions, LabwareId, LocationName};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
struct InstrumentState {
    initialized: bool,
    running: bool,
    loaded: Vec<LabwareId>,
    executed: Vec<String>,
}

/// Simulated instrument: tracks loaded labware and executed commands.
pub struct MockInstrument {
    name: String,
    delay: Duration,
    fail_on: Option<String>,
    state: Mutex<InstrumentState>,
}

impl MockInstrument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            fail_on: None,
            state: Mutex::new(InstrumentState::default()),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make `execute` fail whenever it receives this command.
    #[must_use]
    pub fn failing_on(mut self, command: impl Into<String>) -> Self {
        self.fail_on = Some(command.into());
        self
    }

    /// Commands executed so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InstrumentState>, DriverError> {
        self.state
            .lock()
            .map_err(|e| DriverError::CommandFailed {
                resource: self.name.clone(),
                reason: format!("mutex poisoned: {e}"),
            })
    }

    async fn simulate(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl Executable for MockInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        self.simulate().await;
        self.lock()?.initialized = true;
        Ok(())
    }

    async fn execute(&self, command: &str, _options: &ActionOptions) -> Result<(), DriverError> {
        {
            let mut state = self.lock()?;
            if !state.initialized {
                return Err(DriverError::NotInitialized(self.name.clone()));
            }
            if state.running {
                return Err(DriverError::Busy(self.name.clone()));
            }
            state.running = true;
        }

        self.simulate().await;

        let mut state = self.lock()?;
        state.running = false;
        if self.fail_on.as_deref() == Some(command) {
            return Err(DriverError::CommandFailed {
                resource: self.name.clone(),
                reason: format!("injected failure on '{command}'"),
            });
        }
        state.executed.push(command.to_owned());
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().map(|s| s.running).unwrap_or(false)
    }

    fn is_initialized(&self) -> bool {
        self.state.lock().map(|s| s.initialized).unwrap_or(false)
    }
}

#[async_trait]
impl Loadable for MockInstrument {
    async fn prepare_for_pick(&self, labware: &LabwareId) -> Result<(), DriverError> {
        let state = self.lock()?;
        if state.running {
            return Err(DriverError::Busy(self.name.clone()));
        }
        if !state.loaded.contains(labware) {
            return Err(DriverError::LabwareNotLoaded {
                resource: self.name.clone(),
                labware: labware.to_string(),
            });
        }
        Ok(())
    }

    async fn prepare_for_place(&self, _labware: &LabwareId) -> Result<(), DriverError> {
        if self.lock()?.running {
            return Err(DriverError::Busy(self.name.clone()));
        }
        Ok(())
    }

    fn notify_picked(&self, labware: &LabwareId) -> Result<(), DriverError> {
        let mut state = self.lock()?;
        let before = state.loaded.len();
        state.loaded.retain(|l| l != labware);
        if state.loaded.len() == before {
            return Err(DriverError::LabwareNotLoaded {
                resource: self.name.clone(),
                labware: labware.to_string(),
            });
        }
        Ok(())
    }

    fn notify_placed(&self, labware: &LabwareId) -> Result<(), DriverError> {
        let mut state = self.lock()?;
        if !state.loaded.contains(labware) {
            state.loaded.push(labware.clone());
        }
        Ok(())
    }

    fn loaded_labware(&self) -> Vec<LabwareId> {
        self.state
            .lock()
            .map(|s| s.loaded.clone())
            .unwrap_or_default()
    }
}

/// Simulated arm. Refuses to pick while holding, to place while empty, and
/// to visit any position it was not taught.
pub struct MockTransporter {
    name: String,
    positions: HashSet<LocationName>,
    ordered_positions: Vec<LocationName>,
    delay: Duration,
    holding: Mutex<Option<LabwareId>>,
    moves: Mutex<u64>,
}

impl MockTransporter {
    pub fn new<I, T>(name: impl Into<String>, positions: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<LocationName>,
    {
        let ordered_positions: Vec<LocationName> = positions.into_iter().map(Into::into).collect();
        Self {
            name: name.into(),
            positions: ordered_positions.iter().cloned().collect(),
            ordered_positions,
            delay: Duration::ZERO,
            holding: Mutex::new(None),
            moves: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn holding(&self) -> Option<LabwareId> {
        self.holding.lock().ok().and_then(|h| h.clone())
    }

    /// Completed pick/place pairs.
    pub fn completed_moves(&self) -> u64 {
        self.moves.lock().map(|m| *m).unwrap_or(0)
    }

    fn check_taught(&self, location: &LocationName) -> Result<(), DriverError> {
        if self.positions.contains(location) {
            Ok(())
        } else {
            Err(DriverError::UntaughtPosition {
                transporter: self.name.clone(),
                location: location.to_string(),
            })
        }
    }

    fn poisoned(&self, e: impl std::fmt::Display) -> DriverError {
        DriverError::CommandFailed {
            resource: self.name.clone(),
            reason: format!("mutex poisoned: {e}"),
        }
    }
}

#[async_trait]
impl Transporter for MockTransporter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn pick(&self, location: &LocationName, labware: &LabwareId) -> Result<(), DriverError> {
        self.check_taught(location)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut holding = self.holding.lock().map_err(|e| self.poisoned(e))?;
        if let Some(held) = holding.as_ref() {
            return Err(DriverError::CommandFailed {
                resource: self.name.clone(),
                reason: format!("cannot pick {labware}: already holding {held}"),
            });
        }
        *holding = Some(labware.clone());
        Ok(())
    }

    async fn place(
        &self,
        location: &LocationName,
        labware: &LabwareId,
    ) -> Result<(), DriverError> {
        self.check_taught(location)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let mut holding = self.holding.lock().map_err(|e| self.poisoned(e))?;
        if holding.as_ref() != Some(labware) {
            return Err(DriverError::CommandFailed {
                resource: self.name.clone(),
                reason: format!("cannot place {labware}: not holding it"),
            });
        }
        *holding = None;
        drop(holding);
        *self.moves.lock().map_err(|e| self.poisoned(e))? += 1;
        Ok(())
    }

    fn taught_positions(&self) -> Vec<LocationName> {
        self.ordered_positions.clone()
    }
}

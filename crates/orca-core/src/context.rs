use crate::coordinator::ReservationCoordinator;
use crate::reservation::ReservationManager;
use crate::system_map::SystemMap;
use crate::CoreError;
use orca_runtime::ResourceRegistry;
use orca_schema::{SchedulerSection, ThreadId};
use orca_store::StatusManager;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Runtime form of the `[scheduler]` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub retry_backoff: Duration,
    pub backoff_jitter: f64,
    pub availability_poll: Duration,
    pub max_reservation_attempts: Option<u32>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from(&SchedulerSection::default())
    }
}

impl From<&SchedulerSection> for SchedulerOptions {
    fn from(section: &SchedulerSection) -> Self {
        Self {
            tick_interval: Duration::from_millis(section.tick_interval_ms),
            retry_backoff: Duration::from_millis(section.retry_backoff_ms),
            backoff_jitter: section.backoff_jitter,
            availability_poll: Duration::from_millis(section.availability_poll_ms),
            max_reservation_attempts: section.max_reservation_attempts,
        }
    }
}

impl SchedulerOptions {
    /// Fast timings for tests and simulations.
    pub fn fast() -> Self {
        Self {
            tick_interval: Duration::from_millis(5),
            retry_backoff: Duration::from_millis(3),
            backoff_jitter: 0.5,
            availability_poll: Duration::from_millis(2),
            max_reservation_attempts: None,
        }
    }

    /// Retry delay with `backoff_jitter` applied in both directions.
    pub fn backoff(&self) -> Duration {
        let jitter = self.backoff_jitter.clamp(0.0, 1.0);
        if jitter <= 0.0 {
            return self.retry_backoff;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        self.retry_backoff.mul_f64(factor)
    }

    pub(crate) fn budget(&self, thread: &ThreadId) -> RetryBudget {
        RetryBudget {
            thread: thread.clone(),
            limit: self.max_reservation_attempts,
            used: 0,
        }
    }
}

/// Counts reservation attempts against `max_reservation_attempts`.
pub(crate) struct RetryBudget {
    thread: ThreadId,
    limit: Option<u32>,
    used: u32,
}

impl RetryBudget {
    pub(crate) fn spend(&mut self) -> Result<(), CoreError> {
        self.used = self.used.saturating_add(1);
        match self.limit {
            Some(limit) if self.used > limit => Err(CoreError::ReservationExhausted {
                thread: self.thread.to_string(),
                attempts: limit,
            }),
            _ => Ok(()),
        }
    }
}

/// Everything a labware thread needs, assembled once by `EngineBuilder`.
pub struct OrcaContext {
    pub map: Arc<SystemMap>,
    pub registry: Arc<ResourceRegistry>,
    pub status: Arc<StatusManager>,
    pub reservations: Arc<ReservationManager>,
    pub coordinator: Arc<ReservationCoordinator>,
    pub options: SchedulerOptions,
}

impl OrcaContext {
    pub fn new(
        map: SystemMap,
        registry: ResourceRegistry,
        status: Arc<StatusManager>,
        options: SchedulerOptions,
    ) -> Self {
        let map = Arc::new(map);
        let reservations = Arc::new(ReservationManager::new(Arc::clone(&map)));
        let coordinator = Arc::new(ReservationCoordinator::new(Arc::clone(&reservations)));
        Self {
            map,
            registry: Arc::new(registry),
            status,
            reservations,
            coordinator,
            options,
        }
    }
}

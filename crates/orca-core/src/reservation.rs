//! Single-location claims and the manager that grants them.

use crate::system_map::SystemMap;
use crate::CoreError;
use orca_schema::{LabwareId, LocationName, ThreadId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

static NEXT_RESERVATION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationId(u64);

impl ReservationId {
    fn next() -> Self {
        Self(NEXT_RESERVATION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Pending,
    Granted,
    Rejected,
    Deadlocked,
}

/// One attempt to claim one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationReservation {
    id: ReservationId,
    location: LocationName,
    labware: Option<LabwareId>,
    resolved: Option<LocationName>,
    state: ReservationState,
}

impl LocationReservation {
    pub fn new(location: impl Into<LocationName>, labware: Option<LabwareId>) -> Self {
        Self {
            id: ReservationId::next(),
            location: location.into(),
            labware,
            resolved: None,
            state: ReservationState::Pending,
        }
    }

    pub fn id(&self) -> ReservationId {
        self.id
    }

    pub fn location(&self) -> &LocationName {
        &self.location
    }

    pub fn labware(&self) -> Option<&LabwareId> {
        self.labware.as_ref()
    }

    /// Set once the reservation is granted.
    pub fn resolved_location(&self) -> Option<&LocationName> {
        self.resolved.as_ref()
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn is_granted(&self) -> bool {
        self.state == ReservationState::Granted
    }

    /// Reissue under a fresh id for another attempt.
    fn reset(&mut self) {
        self.id = ReservationId::next();
        self.resolved = None;
        self.state = ReservationState::Pending;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    Granted { index: usize },
    Rejected,
    Deadlocked,
}

/// Mutually exclusive alternatives for one logical request. At most one
/// member survives a resolution.
#[derive(Debug, Clone)]
pub struct ReservationCollection {
    thread: ThreadId,
    labware: Option<LabwareId>,
    candidates: Vec<LocationReservation>,
    outcome: Option<CollectionOutcome>,
}

impl ReservationCollection {
    pub fn new<I>(thread: ThreadId, labware: Option<LabwareId>, locations: I) -> Self
    where
        I: IntoIterator<Item = LocationName>,
    {
        let candidates = locations
            .into_iter()
            .map(|l| LocationReservation::new(l, labware.clone()))
            .collect();
        Self {
            thread,
            labware,
            candidates,
            outcome: None,
        }
    }

    pub fn thread(&self) -> &ThreadId {
        &self.thread
    }

    pub fn labware(&self) -> Option<&LabwareId> {
        self.labware.as_ref()
    }

    pub fn candidates(&self) -> &[LocationReservation] {
        &self.candidates
    }

    pub fn outcome(&self) -> Option<CollectionOutcome> {
        self.outcome
    }

    pub fn is_processed(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn granted(&self) -> Option<&LocationReservation> {
        match self.outcome {
            Some(CollectionOutcome::Granted { index }) => self.candidates.get(index),
            _ => None,
        }
    }

    /// Take the surviving reservation out of a granted collection.
    pub fn into_granted(mut self) -> Option<LocationReservation> {
        match self.outcome {
            Some(CollectionOutcome::Granted { index }) if index < self.candidates.len() => {
                Some(self.candidates.swap_remove(index))
            }
            _ => None,
        }
    }

    pub(crate) fn candidates_mut(&mut self) -> &mut [LocationReservation] {
        &mut self.candidates
    }

    /// Keep the first granted candidate and release every other grant.
    /// With no grant the collection ends rejected.
    pub fn resolve_final_reservation(
        &mut self,
        manager: &ReservationManager,
    ) -> Result<CollectionOutcome, CoreError> {
        if let Some(outcome) = self.outcome {
            return Err(CoreError::ProtocolViolation(format!(
                "collection of thread {} already resolved as {outcome:?}",
                self.thread
            )));
        }

        let mut chosen = None;
        for (index, candidate) in self.candidates.iter_mut().enumerate() {
            match candidate.state {
                ReservationState::Granted if chosen.is_none() => chosen = Some(index),
                ReservationState::Granted => {
                    if let Err(e) = manager.release_reservation(candidate) {
                        error!(reservation = %candidate.id, "releasing surplus grant: {e}");
                    }
                    candidate.state = ReservationState::Rejected;
                    candidate.resolved = None;
                }
                _ => candidate.state = ReservationState::Rejected,
            }
        }

        let outcome = match chosen {
            Some(index) => CollectionOutcome::Granted { index },
            None => CollectionOutcome::Rejected,
        };
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// Upgrade a rejected collection to deadlocked.
    pub fn mark_deadlocked(&mut self) {
        if self.outcome == Some(CollectionOutcome::Rejected) {
            self.outcome = Some(CollectionOutcome::Deadlocked);
            for candidate in &mut self.candidates {
                candidate.state = ReservationState::Deadlocked;
            }
        }
    }

    /// Make the collection submittable again.
    pub fn clear(&mut self) {
        self.outcome = None;
        for candidate in &mut self.candidates {
            candidate.reset();
        }
    }
}

#[derive(Debug, Clone)]
struct Grant {
    reservation: ReservationId,
    labware: Option<LabwareId>,
}

/// One-shot grant/deny test per location. Does not queue.
pub struct ReservationManager {
    map: Arc<SystemMap>,
    granted: Mutex<HashMap<LocationName, Grant>>,
}

impl ReservationManager {
    pub fn new(map: Arc<SystemMap>) -> Self {
        Self {
            map,
            granted: Mutex::new(HashMap::new()),
        }
    }

    pub fn map(&self) -> &Arc<SystemMap> {
        &self.map
    }

    fn grants(&self) -> std::sync::MutexGuard<'_, HashMap<LocationName, Grant>> {
        self.granted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grant when the location is neither reserved nor occupied; otherwise
    /// mark the reservation rejected.
    pub fn attempt_reservation(
        &self,
        reservation: &mut LocationReservation,
    ) -> Result<bool, CoreError> {
        let location = self.map.get_location(&reservation.location)?;
        let mut grants = self.grants();
        if grants.contains_key(&reservation.location) || location.is_occupied() {
            reservation.state = ReservationState::Rejected;
            return Ok(false);
        }
        grants.insert(
            reservation.location.clone(),
            Grant {
                reservation: reservation.id,
                labware: reservation.labware.clone(),
            },
        );
        reservation.state = ReservationState::Granted;
        reservation.resolved = Some(reservation.location.clone());
        debug!(
            location = %reservation.location,
            labware = ?reservation.labware,
            reservation = %reservation.id,
            "reservation granted"
        );
        Ok(true)
    }

    /// Drop a granted claim. Fails if this reservation is not the holder.
    pub fn release_reservation(&self, reservation: &LocationReservation) -> Result<(), CoreError> {
        let mut grants = self.grants();
        match grants.get(&reservation.location) {
            Some(grant) if grant.reservation == reservation.id => {
                grants.remove(&reservation.location);
                debug!(
                    location = %reservation.location,
                    reservation = %reservation.id,
                    "reservation released"
                );
                Ok(())
            }
            _ => Err(CoreError::ProtocolViolation(format!(
                "reservation {} does not hold '{}'",
                reservation.id, reservation.location
            ))),
        }
    }

    pub fn can_reserve(&self, location: &str) -> bool {
        let Ok(loc) = self.map.get_location(location) else {
            return false;
        };
        !self.grants().contains_key(location) && !loc.is_occupied()
    }

    pub fn is_reserved(&self, location: &str) -> bool {
        self.grants().contains_key(location)
    }

    /// Labware the current grant on `location` was issued to.
    pub fn reserved_for(&self, location: &str) -> Option<LabwareId> {
        self.grants().get(location).and_then(|g| g.labware.clone())
    }

    pub fn granted_count(&self) -> usize {
        self.grants().len()
    }

    /// Stage labware at its start location before its thread runs.
    pub fn place_initial(&self, location: &str, labware: &LabwareId) -> Result<(), CoreError> {
        let loc = self.map.get_location(location)?;
        let grants = self.grants();
        if grants.contains_key(location) {
            return Err(CoreError::InvalidArgument(format!(
                "cannot stage {labware} on reserved location '{location}'"
            )));
        }
        loc.notify_placed(labware).map_err(|_| {
            CoreError::InvalidArgument(format!(
                "cannot stage {labware} on occupied location '{location}'"
            ))
        })
    }
}

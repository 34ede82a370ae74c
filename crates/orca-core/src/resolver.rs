//! Narrow an action bound to a resource or pool down to one location.

use crate::context::OrcaContext;
use crate::method::ActionInstance;
use crate::reservation::{CollectionOutcome, LocationReservation, ReservationCollection};
use crate::CoreError;
use orca_schema::{LabwareId, LocationName, ResourceName, ThreadId};
use orca_store::ActionStatus;
use std::sync::Arc;
use tracing::{debug, info};

/// An action pinned to a concrete location.
#[derive(Clone)]
pub struct LocationAction {
    pub action: Arc<ActionInstance>,
    pub location: LocationName,
    pub resource: ResourceName,
    /// `None` when the labware already sat on the chosen location.
    pub reservation: Option<LocationReservation>,
}

impl LocationAction {
    pub fn command(&self) -> &str {
        self.action.command()
    }

    /// Labware that must be loaded before the command runs.
    pub fn inputs(&self) -> &[LabwareId] {
        self.action.inputs()
    }
}

pub enum Resolution {
    Resolved(LocationAction),
    /// The labware itself is on a wait cycle and has to move out of the way.
    Deadlocked,
}

pub struct ResourceActionResolver<'a> {
    ctx: &'a OrcaContext,
}

impl<'a> ResourceActionResolver<'a> {
    pub fn new(ctx: &'a OrcaContext) -> Self {
        Self { ctx }
    }

    /// Every location hosting a resource the action may still run on.
    fn candidates(&self, action: &ActionInstance) -> Vec<(LocationName, ResourceName)> {
        let resources = match action.bound_resource() {
            Some(bound) => vec![bound],
            None => action.resources().to_vec(),
        };
        resources
            .iter()
            .flat_map(|resource| {
                self.ctx
                    .map
                    .get_resource_locations(resource)
                    .into_iter()
                    .map(move |l| (l.name().clone(), resource.clone()))
            })
            .collect()
    }

    /// Reachable candidates, nearest first.
    fn by_distance(
        &self,
        current: &LocationName,
        candidates: Vec<(LocationName, ResourceName)>,
    ) -> Result<Vec<(LocationName, ResourceName)>, CoreError> {
        let mut ranked: Vec<(u32, LocationName, ResourceName)> = candidates
            .into_iter()
            .filter_map(|(location, resource)| {
                self.ctx
                    .map
                    .get_distance(current, &location)
                    .ok()
                    .map(|d| (d, location, resource))
            })
            .collect();
        if ranked.is_empty() {
            return Err(CoreError::NoPath {
                from: current.to_string(),
                to: "any candidate location".to_owned(),
            });
        }
        ranked.sort_by_key(|(d, _, _)| *d);
        Ok(ranked.into_iter().map(|(_, l, r)| (l, r)).collect())
    }

    pub async fn resolve_action(
        &self,
        thread: &ThreadId,
        labware: &LabwareId,
        current: &LocationName,
        action: &Arc<ActionInstance>,
    ) -> Result<Resolution, CoreError> {
        action.advance(ActionStatus::Resolving)?;
        let mut budget = self.ctx.options.budget(thread);

        loop {
            let candidates = self.candidates(action);
            if candidates.is_empty() {
                return Err(CoreError::NotFound(format!(
                    "location for any resource of action {}",
                    action.id()
                )));
            }

            if let Some((location, resource)) = candidates.iter().find(|(l, _)| l == current) {
                if action.bind(resource) == *resource {
                    debug!(%thread, %labware, %location, "action runs where the labware is");
                    return self.resolved(action, location.clone(), resource.clone(), None);
                }
                continue;
            }

            let ordered = self.by_distance(current, candidates)?;
            budget.spend()?;
            let collection = ReservationCollection::new(
                thread.clone(),
                Some(labware.clone()),
                ordered.iter().map(|(l, _)| l.clone()),
            );
            let resolved = self.ctx.coordinator.request(collection).await?;
            match resolved.outcome() {
                Some(CollectionOutcome::Granted { .. }) => {
                    let reservation = resolved.into_granted().ok_or_else(|| {
                        CoreError::ProtocolViolation("granted collection without a grant".into())
                    })?;
                    let Some((_, resource)) =
                        ordered.iter().find(|(l, _)| l == reservation.location())
                    else {
                        return Err(CoreError::ProtocolViolation(format!(
                            "granted '{}' is not a candidate",
                            reservation.location()
                        )));
                    };
                    if action.bind(resource) == *resource {
                        let location = reservation.location().clone();
                        info!(%thread, %labware, %location, %resource, "action resolved");
                        return self.resolved(action, location, resource.clone(), Some(reservation));
                    }
                    // A co-thread bound another resource in the meantime.
                    self.ctx.reservations.release_reservation(&reservation)?;
                }
                Some(CollectionOutcome::Deadlocked) => return Ok(Resolution::Deadlocked),
                Some(CollectionOutcome::Rejected) | None => {
                    tokio::time::sleep(self.ctx.options.backoff()).await;
                }
            }
        }
    }

    fn resolved(
        &self,
        action: &Arc<ActionInstance>,
        location: LocationName,
        resource: ResourceName,
        reservation: Option<LocationReservation>,
    ) -> Result<Resolution, CoreError> {
        action.advance(ActionStatus::Resolved)?;
        Ok(Resolution::Resolved(LocationAction {
            action: Arc::clone(action),
            location,
            resource,
            reservation,
        }))
    }
}

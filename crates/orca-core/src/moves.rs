//! Single-hop move resolution and physical execution.

use crate::context::OrcaContext;
use crate::reservation::{CollectionOutcome, LocationReservation, ReservationCollection};
use crate::resolver::LocationAction;
use crate::system_map::Path;
use crate::CoreError;
use orca_runtime::Instrument;
use orca_schema::{ActionId, LabwareId, LocationName, ResourceName, ThreadId};
use orca_store::{ActionStatus, Status};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One hop of one labware on one transporter.
#[derive(Debug, Clone)]
pub struct MoveAction {
    pub id: ActionId,
    pub labware: LabwareId,
    pub source: LocationName,
    pub target: LocationName,
    pub transporter: ResourceName,
    /// `None` when the target is held by a reservation owned elsewhere.
    pub reservation: Option<LocationReservation>,
    pub release_on_place: bool,
}

/// Distinct second nodes of the given paths, in path order.
fn first_hops(paths: &[Path], avoid: Option<&LocationName>) -> Vec<LocationName> {
    let mut hops: Vec<LocationName> = Vec::new();
    for path in paths {
        let Some(hop) = path.get(1) else { continue };
        if avoid.is_some_and(|a| a == hop || path.last() == Some(a)) {
            continue;
        }
        if !hops.contains(hop) {
            hops.push(hop.clone());
        }
    }
    hops
}

pub struct MoveHandler<'a> {
    ctx: &'a OrcaContext,
}

impl<'a> MoveHandler<'a> {
    pub fn new(ctx: &'a OrcaContext) -> Self {
        Self { ctx }
    }

    fn build(
        &self,
        labware: &LabwareId,
        source: &LocationName,
        target: &LocationName,
        reservation: Option<LocationReservation>,
        release_on_place: bool,
    ) -> Result<MoveAction, CoreError> {
        let transporter = self.ctx.map.get_transporter_between(source, target)?.clone();
        Ok(MoveAction {
            id: ActionId::generate(),
            labware: labware.clone(),
            source: source.clone(),
            target: target.clone(),
            transporter,
            reservation,
            release_on_place,
        })
    }

    /// Pick and reserve the next hop from `current` toward `target`.
    ///
    /// Contention retries after a jittered backoff. A deadlock triggers one
    /// escape attempt toward the nearest parking location, whose move is
    /// returned instead when granted.
    pub async fn resolve_move_action(
        &self,
        thread: &ThreadId,
        labware: &LabwareId,
        current: &LocationName,
        target: &LocationName,
        assigned: Option<&LocationAction>,
    ) -> Result<MoveAction, CoreError> {
        let paths = self.ctx.map.get_all_shortest_any_paths(current, target)?;
        let hops = first_hops(&paths, None);

        if let Some(assigned) = assigned {
            if assigned.reservation.is_some() && hops.contains(&assigned.location) {
                debug!(%thread, %labware, target = %assigned.location, "reusing action reservation");
                return self.build(labware, current, &assigned.location, None, false);
            }
        }

        let mut budget = self.ctx.options.budget(thread);
        let mut collection = ReservationCollection::new(thread.clone(), Some(labware.clone()), hops);
        loop {
            budget.spend()?;
            let mut resolved = self.ctx.coordinator.request(collection).await?;
            match resolved.outcome() {
                Some(CollectionOutcome::Granted { .. }) => {
                    let reservation = resolved.into_granted().ok_or_else(|| {
                        CoreError::ProtocolViolation("granted collection without a grant".into())
                    })?;
                    let hop = reservation.location().clone();
                    return self.build(labware, current, &hop, Some(reservation), true);
                }
                Some(CollectionOutcome::Deadlocked) => {
                    if let Some(escape) = self
                        .handle_deadlock(thread, labware, current, Some(target))
                        .await?
                    {
                        return Ok(escape);
                    }
                }
                Some(CollectionOutcome::Rejected) | None => {}
            }
            resolved.clear();
            collection = resolved;
            tokio::time::sleep(self.ctx.options.backoff()).await;
        }
    }

    /// Try once to reserve a hop toward the nearest free parking location,
    /// never toward `avoid`.
    pub async fn handle_deadlock(
        &self,
        thread: &ThreadId,
        labware: &LabwareId,
        source: &LocationName,
        avoid: Option<&LocationName>,
    ) -> Result<Option<MoveAction>, CoreError> {
        let paths = self.ctx.map.get_shortest_paths_to_deadlock_resolution(source)?;
        let hops = first_hops(&paths, avoid);
        if hops.is_empty() {
            warn!(%thread, %labware, %source, "no parking location to escape a deadlock");
            return Ok(None);
        }

        let collection = ReservationCollection::new(thread.clone(), Some(labware.clone()), hops);
        let resolved = self.ctx.coordinator.request(collection).await?;
        match resolved.into_granted() {
            Some(reservation) => {
                let hop = reservation.location().clone();
                info!(%thread, %labware, from = %source, to = %hop, "escaping deadlock");
                self.build(labware, source, &hop, Some(reservation), true).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Poll until the move's target is physically empty.
    pub async fn await_target_available(&self, action: &MoveAction) -> Result<(), CoreError> {
        let target = self.ctx.map.get_location(&action.target)?;
        while target.occupant().is_some_and(|o| o != action.labware) {
            tokio::time::sleep(self.ctx.options.availability_poll).await;
        }
        Ok(())
    }
}

pub struct ExecutingMoveAction<'a> {
    ctx: &'a OrcaContext,
    action: MoveAction,
}

impl<'a> ExecutingMoveAction<'a> {
    pub fn new(ctx: &'a OrcaContext, action: MoveAction) -> Self {
        Self { ctx, action }
    }

    pub fn action(&self) -> &MoveAction {
        &self.action
    }

    pub async fn execute(self) -> Result<MoveAction, CoreError> {
        self.record(ActionStatus::Executing)?;
        match self.perform().await {
            Ok(()) => {
                if self.action.release_on_place {
                    if let Some(reservation) = &self.action.reservation {
                        self.ctx.reservations.release_reservation(reservation)?;
                    }
                }
                self.record(ActionStatus::Completed)?;
                Ok(self.action)
            }
            Err(e) => {
                error!(
                    labware = %self.action.labware,
                    source = %self.action.source,
                    target = %self.action.target,
                    transporter = %self.action.transporter,
                    "move failed: {e}"
                );
                self.release_if_unplaced();
                if let Err(status_err) = self.record(ActionStatus::Errored) {
                    warn!("recording failed move: {status_err}");
                }
                Err(e)
            }
        }
    }

    async fn perform(&self) -> Result<(), CoreError> {
        let a = &self.action;
        let map = &self.ctx.map;
        let registry = &self.ctx.registry;
        let source = map.get_location(&a.source)?;
        let target = map.get_location(&a.target)?;
        let arm = registry.transporter(&a.transporter)?;
        let source_instrument = source.resource().map(|r| registry.instrument(r)).transpose()?;
        let target_instrument = target.resource().map(|r| registry.instrument(r)).transpose()?;

        let _arm = arm.acquire().await;
        debug!(labware = %a.labware, source = %a.source, target = %a.target, "moving");

        if let Some(instrument) = &source_instrument {
            self.await_idle(instrument).await;
            instrument.prepare_for_pick(&a.labware).await?;
        }
        if let Some(instrument) = &target_instrument {
            self.await_idle(instrument).await;
            instrument.prepare_for_place(&a.labware).await?;
        }

        arm.driver().pick(&a.source, &a.labware).await?;
        source.notify_picked(&a.labware)?;
        if let Some(instrument) = &source_instrument {
            instrument.notify_picked(&a.labware)?;
        }

        arm.driver().place(&a.target, &a.labware).await?;
        target.notify_placed(&a.labware)?;
        if let Some(instrument) = &target_instrument {
            instrument.notify_placed(&a.labware)?;
        }
        Ok(())
    }

    async fn await_idle(&self, instrument: &Arc<dyn Instrument>) {
        while instrument.is_running() {
            tokio::time::sleep(self.ctx.options.availability_poll).await;
        }
    }

    fn release_if_unplaced(&self) {
        let Some(reservation) = &self.action.reservation else {
            return;
        };
        let placed = self
            .ctx
            .map
            .get_location(&self.action.target)
            .is_ok_and(|t| t.occupant().as_ref() == Some(&self.action.labware));
        if !placed {
            if let Err(e) = self.ctx.reservations.release_reservation(reservation) {
                warn!("releasing reservation of failed move: {e}");
            }
        }
    }

    fn record(&self, status: ActionStatus) -> Result<(), CoreError> {
        let a = &self.action;
        self.ctx.status.set_status(
            &a.id,
            Status::Move(status),
            json!({
                "labware": a.labware,
                "source": a.source,
                "target": a.target,
                "transporter": a.transporter,
            }),
        )?;
        Ok(())
    }
}

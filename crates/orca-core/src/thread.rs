//! The executing labware thread.
//!
//! Walks one labware through its methods. For each action the labware takes
//! part in: resolve the action to a location, hop toward it one reserved move
//! at a time, wait for co-thread labware, then execute (or wait for the
//! co-thread that does). After the last method the labware travels to its end
//! location. `stop()` is honored between hops and between actions.

use crate::context::OrcaContext;
use crate::lifecycle::validate_transition;
use crate::method::{ActionInstance, MethodInstance};
use crate::moves::{ExecutingMoveAction, MoveAction, MoveHandler};
use crate::reservation::LocationReservation;
use crate::resolver::{LocationAction, Resolution, ResourceActionResolver};
use crate::CoreError;
use orca_runtime::Instrument;
use orca_schema::{LabwareId, LocationName, TemplateName, ThreadId};
use orca_store::{ActionStatus, LabwareThreadStatus as S};
use serde_json::json;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct ThreadState {
    status: S,
    current: LocationName,
}

enum Finish {
    Completed,
    Stopped,
}

pub struct LabwareThread {
    id: ThreadId,
    labware: LabwareId,
    labware_template: TemplateName,
    start: LocationName,
    end: LocationName,
    methods: Vec<Arc<MethodInstance>>,
    ctx: Arc<OrcaContext>,
    stop: watch::Sender<bool>,
    state: Mutex<ThreadState>,
}

impl fmt::Debug for LabwareThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LabwareThread")
            .field("id", &self.id)
            .field("labware", &self.labware)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("status", &state.status)
            .field("current", &state.current)
            .finish_non_exhaustive()
    }
}

impl LabwareThread {
    /// The labware is expected to already sit on `start`.
    pub fn new(
        ctx: Arc<OrcaContext>,
        labware_template: TemplateName,
        labware: LabwareId,
        start: LocationName,
        end: LocationName,
        methods: Vec<Arc<MethodInstance>>,
    ) -> Result<Self, CoreError> {
        ctx.map.get_location(&start)?;
        ctx.map.get_location(&end)?;
        let thread = Self {
            id: ThreadId::generate(),
            labware,
            labware_template,
            start: start.clone(),
            end,
            methods,
            ctx,
            stop: watch::channel(false).0,
            state: Mutex::new(ThreadState {
                status: S::Created,
                current: start,
            }),
        };
        thread.record(S::Created, None)?;
        Ok(thread)
    }

    pub fn id(&self) -> &ThreadId {
        &self.id
    }

    pub fn labware(&self) -> &LabwareId {
        &self.labware
    }

    pub fn labware_template(&self) -> &TemplateName {
        &self.labware_template
    }

    pub fn start_location(&self) -> &LocationName {
        &self.start
    }

    pub fn end_location(&self) -> &LocationName {
        &self.end
    }

    pub fn methods(&self) -> &[Arc<MethodInstance>] {
        &self.methods
    }

    pub fn status(&self) -> S {
        self.lock().status
    }

    pub fn current_location(&self) -> LocationName {
        self.lock().current.clone()
    }

    /// Request a cooperative stop, honored at the next hop or action
    /// boundary, and while waiting on co-threads to finish a shared method.
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!(thread = %self.id, labware = %self.labware, "stop requested");
        }
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Drive `fut` until it finishes or a stop arrives. `None` means stopped.
    async fn unless_stopped<T>(&self, fut: impl Future<Output = T>) -> Option<T> {
        let mut stop = self.stop.subscribe();
        tokio::select! {
            out = fut => Some(out),
            _ = stop.wait_for(|stopped| *stopped) => None,
        }
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<Result<S, CoreError>> {
        let thread = Arc::clone(self);
        tokio::spawn(async move { thread.run().await })
    }

    pub async fn run(&self) -> Result<S, CoreError> {
        info!(
            thread = %self.id,
            labware = %self.labware,
            start = %self.start,
            end = %self.end,
            methods = self.methods.len(),
            "labware thread started"
        );
        let mut held = Vec::new();
        let result = self.drive(&mut held).await;
        for reservation in held.drain(..) {
            self.release(&reservation);
        }

        match result {
            Ok(Finish::Completed) => {
                self.transition(S::Completed)?;
                info!(thread = %self.id, labware = %self.labware, location = %self.end, "labware thread completed");
                Ok(S::Completed)
            }
            Ok(Finish::Stopped) => {
                self.transition(S::Stopping)?;
                self.transition(S::Stopped)?;
                info!(thread = %self.id, labware = %self.labware, "labware thread stopped");
                Ok(S::Stopped)
            }
            Err(e) => {
                error!(thread = %self.id, labware = %self.labware, "labware thread errored: {e}");
                if let Err(te) = self.transition_with(S::Errored, Some(&e)) {
                    warn!(thread = %self.id, "recording errored thread: {te}");
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, held: &mut Vec<LocationReservation>) -> Result<Finish, CoreError> {
        for method in &self.methods {
            let actions: Vec<Arc<ActionInstance>> =
                method.actions_for(&self.labware).cloned().collect();
            for action in &actions {
                if self.stop_requested() {
                    return Ok(Finish::Stopped);
                }
                method.mark_started()?;
                let Some(assigned) = self.resolve(action, held).await? else {
                    return Ok(Finish::Stopped);
                };
                if let Some(reservation) = &assigned.reservation {
                    held.push(reservation.clone());
                }
                if !self.travel(&assigned.location, Some(&assigned), held).await? {
                    return Ok(Finish::Stopped);
                }
                if !self.execute_action(method, &assigned).await? {
                    return Ok(Finish::Stopped);
                }
            }
            // Co-threads may still be heading to their own actions.
            match self.unless_stopped(method.wait_completed()).await {
                Some(done) => done?,
                None => return Ok(Finish::Stopped),
            }
            debug!(thread = %self.id, method = %method.id(), "method done");
        }

        if !self.travel(&self.end, None, held).await? {
            return Ok(Finish::Stopped);
        }
        Ok(Finish::Completed)
    }

    /// Resolve an action, escaping to a parking location whenever the
    /// labware's own position is part of a deadlock. `None` means stopped.
    async fn resolve(
        &self,
        action: &Arc<ActionInstance>,
        held: &mut Vec<LocationReservation>,
    ) -> Result<Option<LocationAction>, CoreError> {
        let resolver = ResourceActionResolver::new(&self.ctx);
        loop {
            self.transition(S::AwaitingActionReservation)?;
            let current = self.current_location();
            let resolution = self
                .unless_stopped(resolver.resolve_action(&self.id, &self.labware, &current, action))
                .await;
            let Some(resolution) = resolution else {
                return Ok(None);
            };
            match resolution? {
                Resolution::Resolved(assigned) => return Ok(Some(assigned)),
                Resolution::Deadlocked => {
                    self.transition(S::AwaitingMoveReservation)?;
                    let escape = MoveHandler::new(&self.ctx)
                        .handle_deadlock(&self.id, &self.labware, &current, None)
                        .await?;
                    match escape {
                        Some(mv) => self.perform_move(mv, held).await?,
                        None => tokio::time::sleep(self.ctx.options.backoff()).await,
                    }
                }
            }
        }
    }

    /// Hop toward `target`. Returns `false` if stopped on the way.
    async fn travel(
        &self,
        target: &LocationName,
        assigned: Option<&LocationAction>,
        held: &mut Vec<LocationReservation>,
    ) -> Result<bool, CoreError> {
        let handler = MoveHandler::new(&self.ctx);
        loop {
            let current = self.current_location();
            if current == *target {
                return Ok(true);
            }
            if self.stop_requested() {
                return Ok(false);
            }
            self.transition(S::AwaitingMoveReservation)?;
            let mv = self
                .unless_stopped(handler.resolve_move_action(
                    &self.id,
                    &self.labware,
                    &current,
                    target,
                    assigned,
                ))
                .await;
            match mv {
                Some(mv) => self.perform_move(mv?, held).await?,
                None => return Ok(false),
            }
        }
    }

    async fn perform_move(
        &self,
        mv: MoveAction,
        held: &mut Vec<LocationReservation>,
    ) -> Result<(), CoreError> {
        self.transition(S::AwaitingMoveTargetAvailability)?;
        MoveHandler::new(&self.ctx).await_target_available(&mv).await?;
        self.transition(S::Moving)?;
        let done = ExecutingMoveAction::new(&self.ctx, mv).execute().await?;
        self.lock().current = done.target.clone();

        // Claims on the location just vacated are no longer needed.
        held.retain(|reservation| {
            if reservation.location() == &done.source {
                self.release(reservation);
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// Returns `false` if stopped while a co-thread runs the action.
    async fn execute_action(
        &self,
        method: &MethodInstance,
        assigned: &LocationAction,
    ) -> Result<bool, CoreError> {
        let action = &assigned.action;
        let instrument = self.ctx.registry.instrument(&assigned.resource)?;

        self.transition(S::AwaitingCoThreads)?;
        action.advance(ActionStatus::AwaitingCoThreads)?;
        self.await_co_threads(action, &instrument).await?;

        self.transition(S::ExecutingAction)?;
        if !action.try_begin()? {
            debug!(thread = %self.id, action = %action.id(), "co-thread executes the action");
            return match self.unless_stopped(action.wait_finished()).await {
                Some(done) => done.map(|()| true),
                None => Ok(false),
            };
        }

        info!(
            thread = %self.id,
            action = %action.id(),
            resource = %assigned.resource,
            location = %assigned.location,
            command = action.command(),
            "executing action"
        );
        let result = instrument.execute(action.command(), action.options()).await;
        action.finish(result.is_ok())?;
        method.action_finished()?;
        result.map(|()| true).map_err(|e| {
            error!(thread = %self.id, action = %action.id(), resource = %assigned.resource, "action failed: {e}");
            CoreError::from(e)
        })
    }

    /// Poll until every input labware is loaded on the instrument, or a
    /// co-thread has already started the action.
    ///
    /// A stop here is an error: the labware is already staged and the
    /// co-threads may never arrive.
    async fn await_co_threads(
        &self,
        action: &ActionInstance,
        instrument: &Arc<dyn Instrument>,
    ) -> Result<(), CoreError> {
        loop {
            let status = action.status();
            if status == ActionStatus::Executing || status.is_terminal() {
                return Ok(());
            }
            let loaded = instrument.loaded_labware();
            if action.inputs().iter().all(|l| loaded.contains(l)) {
                return Ok(());
            }
            if self.stop_requested() {
                return Err(CoreError::Stopped(self.id.to_string()));
            }
            tokio::time::sleep(self.ctx.options.availability_poll).await;
        }
    }

    fn release(&self, reservation: &LocationReservation) {
        if let Err(e) = self.ctx.reservations.release_reservation(reservation) {
            warn!(thread = %self.id, location = %reservation.location(), "releasing reservation: {e}");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ThreadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: S) -> Result<(), CoreError> {
        self.transition_with(to, None)
    }

    fn transition_with(&self, to: S, error: Option<&CoreError>) -> Result<(), CoreError> {
        let (from, location) = {
            let mut state = self.lock();
            if state.status == to {
                return Ok(());
            }
            validate_transition(state.status, to)?;
            let from = state.status;
            state.status = to;
            (from, state.current.clone())
        };
        debug!(thread = %self.id, %from, %to, location = %location, "thread transition");
        self.record(to, error)
    }

    fn record(&self, status: S, error: Option<&CoreError>) -> Result<(), CoreError> {
        let location = self.current_location();
        self.ctx.status.set_status(
            &self.id,
            status,
            json!({
                "labware": self.labware,
                "labware_template": self.labware_template,
                "location": location,
                "error": error.map(ToString::to_string),
            }),
        )?;
        Ok(())
    }
}

//! Batched reservation resolution on a fixed tick.
//!
//! Threads enqueue `ReservationCollection`s and await a reply. Each tick
//! swaps the queue out, attempts every candidate against the
//! `ReservationManager`, resolves each collection to a single outcome, then
//! runs deadlock detection over everything rejected in that tick. A rejected
//! request waits for the occupant of the location, or for the holder of its
//! reservation when it is still empty.

use crate::deadlock::find_deadlocked;
use crate::reservation::{CollectionOutcome, ReservationCollection, ReservationManager};
use crate::CoreError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

struct PendingRequest {
    collection: ReservationCollection,
    reply: oneshot::Sender<ReservationCollection>,
}

/// Handle to a submitted collection; resolves after the next tick.
///
/// Dropping the handle gives up the request. A grant already delivered to
/// it is released.
pub struct PendingReservation {
    rx: oneshot::Receiver<ReservationCollection>,
    manager: Arc<ReservationManager>,
}

impl PendingReservation {
    pub async fn processed(mut self) -> Result<ReservationCollection, CoreError> {
        (&mut self.rx)
            .await
            .map_err(|_| CoreError::CoordinatorUnavailable)
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        let Ok(orphan) = self.rx.try_recv() else {
            return;
        };
        if let Some(granted) = orphan.granted() {
            debug!(location = %granted.location(), "releasing grant of an abandoned request");
            if let Err(e) = self.manager.release_reservation(granted) {
                error!("releasing abandoned grant: {e}");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub granted: usize,
    pub rejected: usize,
    pub deadlocked: usize,
}

impl TickReport {
    pub fn processed(&self) -> usize {
        self.granted + self.rejected + self.deadlocked
    }
}

pub struct ReservationCoordinator {
    manager: Arc<ReservationManager>,
    queue: Mutex<Vec<PendingRequest>>,
    ticks: AtomicU64,
}

impl ReservationCoordinator {
    pub fn new(manager: Arc<ReservationManager>) -> Self {
        Self {
            manager,
            queue: Mutex::new(Vec::new()),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn manager(&self) -> &Arc<ReservationManager> {
        &self.manager
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Enqueue a collection for the next tick and return immediately.
    pub fn submit_reservation_request(
        &self,
        collection: ReservationCollection,
    ) -> Result<PendingReservation, CoreError> {
        if collection.is_processed() {
            return Err(CoreError::ProtocolViolation(format!(
                "collection of thread {} resubmitted without clearing",
                collection.thread()
            )));
        }
        if collection.candidates().is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "thread {} submitted a collection with no candidates",
                collection.thread()
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PendingRequest { collection, reply });
        Ok(PendingReservation {
            rx,
            manager: Arc::clone(&self.manager),
        })
    }

    /// Submit and wait for the tick that resolves it.
    pub async fn request(
        &self,
        collection: ReservationCollection,
    ) -> Result<ReservationCollection, CoreError> {
        self.submit_reservation_request(collection)?.processed().await
    }

    pub fn tick(&self) -> TickReport {
        let batch = std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner));
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };

        let mut resolved = Vec::with_capacity(batch.len());
        for PendingRequest {
            mut collection,
            reply,
        } in batch
        {
            let thread = collection.thread().clone();
            for candidate in collection.candidates_mut() {
                if let Err(e) = self.manager.attempt_reservation(candidate) {
                    warn!(tick, %thread, "reservation attempt failed: {e}");
                }
            }
            if let Err(e) = collection.resolve_final_reservation(&self.manager) {
                error!(tick, "{e}");
            }
            resolved.push((collection, reply));
        }

        let map = self.manager.map();
        let deadlocked = find_deadlocked(
            resolved
                .iter()
                .map(|(c, _)| c)
                .filter(|c| c.outcome() == Some(CollectionOutcome::Rejected)),
            |location| {
                map.get_location(location)
                    .ok()
                    .and_then(|l| l.occupant())
                    .or_else(|| self.manager.reserved_for(location))
            },
        );

        for (mut collection, reply) in resolved {
            if collection
                .labware()
                .is_some_and(|labware| deadlocked.contains(labware))
            {
                collection.mark_deadlocked();
            }
            match collection.outcome() {
                Some(CollectionOutcome::Granted { .. }) => report.granted += 1,
                Some(CollectionOutcome::Deadlocked) => {
                    warn!(
                        tick,
                        thread = %collection.thread(),
                        labware = ?collection.labware(),
                        "deadlock detected"
                    );
                    report.deadlocked += 1;
                }
                Some(CollectionOutcome::Rejected) | None => report.rejected += 1,
            }
            if let Err(orphan) = reply.send(collection) {
                // Requester went away; do not leak its grant.
                if let Some(granted) = orphan.granted() {
                    if let Err(e) = self.manager.release_reservation(granted) {
                        error!(tick, "releasing orphaned grant: {e}");
                    }
                }
            }
        }

        if report.processed() > 0 {
            debug!(
                tick,
                granted = report.granted,
                rejected = report.rejected,
                deadlocked = report.deadlocked,
                "tick resolved"
            );
        }
        report
    }

    /// Run `tick` every `interval` on its own task until stopped.
    pub fn start_tick_loop(self: &Arc<Self>, interval: Duration) -> TickLoop {
        let interval = interval.max(Duration::from_millis(1));
        let (stop, mut stop_rx) = watch::channel(false);
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "reservation tick loop starting");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = stop_rx.changed() => {
                        info!("reservation tick loop stopping");
                        break;
                    }

                    _ = ticker.tick() => {
                        coordinator.tick();
                    }
                }
            }
        });
        TickLoop { stop, handle }
    }
}

/// Running tick loop. Dropping it also stops the loop.
pub struct TickLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl TickLoop {
    pub async fn stop(self) -> Result<(), CoreError> {
        // A send error means the loop already exited.
        let _ = self.stop.send(true);
        self.handle.await?;
        Ok(())
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

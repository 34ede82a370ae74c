//! In-process publish/subscribe keyed by event name.
//!
//! Event names take the forms `KIND.STATUS` and `KIND.id.STATUS`. Handlers
//! run synchronously inside `publish`, on the task that recorded the status,
//! so a subscriber always observes the store already updated.

use crate::status::{Status, StatusKind};
use crate::StatusError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub name: String,
    pub kind: StatusKind,
    pub id: String,
    pub status: Status,
    pub context: serde_json::Value,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    waiters: Mutex<HashMap<String, Vec<oneshot::Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, name: &str, handler: F) -> Result<SubscriptionId, StatusError>
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self
            .handlers
            .write()
            .map_err(|e| StatusError::Poisoned(e.to_string()))?;
        handlers
            .entry(name.to_owned())
            .or_default()
            .push((id, Arc::new(handler)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, StatusError> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|e| StatusError::Poisoned(e.to_string()))?;
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sub, _)| *sub != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        Ok(removed)
    }

    /// Resolve once, on the next event published under `name`.
    ///
    /// Register before checking the state the event would report, otherwise
    /// an event published in between is missed.
    pub fn subscribe_once(&self, name: &str) -> Result<oneshot::Receiver<Event>, StatusError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self
            .waiters
            .lock()
            .map_err(|e| StatusError::Poisoned(e.to_string()))?;
        prune_closed(&mut waiters);
        waiters.entry(name.to_owned()).or_default().push(tx);
        Ok(rx)
    }

    /// Once-waiters still registered, across all names.
    pub fn waiter_count(&self) -> Result<usize, StatusError> {
        let waiters = self
            .waiters
            .lock()
            .map_err(|e| StatusError::Poisoned(e.to_string()))?;
        Ok(waiters.values().map(Vec::len).sum())
    }

    pub fn publish(&self, event: &Event) -> Result<(), StatusError> {
        // Clone the handler list out so a handler may subscribe or publish.
        let handlers: Vec<Handler> = {
            let handlers = self
                .handlers
                .read()
                .map_err(|e| StatusError::Poisoned(e.to_string()))?;
            handlers
                .get(&event.name)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(event);
        }

        let waiters = {
            let mut waiters = self
                .waiters
                .lock()
                .map_err(|e| StatusError::Poisoned(e.to_string()))?;
            let fired = waiters.remove(&event.name).unwrap_or_default();
            prune_closed(&mut waiters);
            fired
        };
        for waiter in waiters {
            // Receiver dropped means the waiter gave up; nothing to deliver.
            let _ = waiter.send(event.clone());
        }
        Ok(())
    }
}

/// Drop waiters whose receiver is gone, e.g. the losing side of a
/// completed-or-errored wait.
fn prune_closed(waiters: &mut HashMap<String, Vec<oneshot::Sender<Event>>>) {
    waiters.retain(|_, list| {
        list.retain(|tx| !tx.is_closed());
        !list.is_empty()
    });
}

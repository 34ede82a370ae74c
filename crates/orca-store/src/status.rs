use crate::events::{Event, EventBus};
use crate::StatusError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::trace;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Action,
    Move,
    Method,
    LabwareThread,
    Workflow,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Action => write!(f, "ACTION"),
            StatusKind::Move => write!(f, "MOVE"),
            StatusKind::Method => write!(f, "METHOD"),
            StatusKind::LabwareThread => write!(f, "LABWARE_THREAD"),
            StatusKind::Workflow => write!(f, "WORKFLOW"),
        }
    }
}

/// Lifecycle of an action or a move.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Created,
    Resolving,
    Resolved,
    AwaitingCoThreads,
    Executing,
    Completed,
    Errored,
}

impl ActionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Errored)
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStatus::Created => write!(f, "CREATED"),
            ActionStatus::Resolving => write!(f, "RESOLVING"),
            ActionStatus::Resolved => write!(f, "RESOLVED"),
            ActionStatus::AwaitingCoThreads => write!(f, "AWAITING_CO_THREADS"),
            ActionStatus::Executing => write!(f, "EXECUTING"),
            ActionStatus::Completed => write!(f, "COMPLETED"),
            ActionStatus::Errored => write!(f, "ERRORED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MethodStatus {
    Created,
    InProgress,
    Completed,
    Errored,
}

impl fmt::Display for MethodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodStatus::Created => write!(f, "CREATED"),
            MethodStatus::InProgress => write!(f, "IN_PROGRESS"),
            MethodStatus::Completed => write!(f, "COMPLETED"),
            MethodStatus::Errored => write!(f, "ERRORED"),
        }
    }
}

/// States of the per-labware thread state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabwareThreadStatus {
    Created,
    AwaitingActionReservation,
    AwaitingMoveReservation,
    AwaitingMoveTargetAvailability,
    Moving,
    AwaitingCoThreads,
    ExecutingAction,
    Stopping,
    Stopped,
    Completed,
    Errored,
}

impl LabwareThreadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LabwareThreadStatus::Stopped
                | LabwareThreadStatus::Completed
                | LabwareThreadStatus::Errored
        )
    }
}

impl fmt::Display for LabwareThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabwareThreadStatus::Created => write!(f, "CREATED"),
            LabwareThreadStatus::AwaitingActionReservation => {
                write!(f, "AWAITING_ACTION_RESERVATION")
            }
            LabwareThreadStatus::AwaitingMoveReservation => write!(f, "AWAITING_MOVE_RESERVATION"),
            LabwareThreadStatus::AwaitingMoveTargetAvailability => {
                write!(f, "AWAITING_MOVE_TARGET_AVAILABILITY")
            }
            LabwareThreadStatus::Moving => write!(f, "MOVING"),
            LabwareThreadStatus::AwaitingCoThreads => write!(f, "AWAITING_CO_THREADS"),
            LabwareThreadStatus::ExecutingAction => write!(f, "EXECUTING_ACTION"),
            LabwareThreadStatus::Stopping => write!(f, "STOPPING"),
            LabwareThreadStatus::Stopped => write!(f, "STOPPED"),
            LabwareThreadStatus::Completed => write!(f, "COMPLETED"),
            LabwareThreadStatus::Errored => write!(f, "ERRORED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Stopped,
    Errored,
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowStatus::Created => write!(f, "CREATED"),
            WorkflowStatus::Running => write!(f, "RUNNING"),
            WorkflowStatus::Completed => write!(f, "COMPLETED"),
            WorkflowStatus::Stopped => write!(f, "STOPPED"),
            WorkflowStatus::Errored => write!(f, "ERRORED"),
        }
    }
}

/// Any status value, tagged with the kind of entity it describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Action(ActionStatus),
    Move(ActionStatus),
    Method(MethodStatus),
    LabwareThread(LabwareThreadStatus),
    Workflow(WorkflowStatus),
}

impl Status {
    pub fn kind(&self) -> StatusKind {
        match self {
            Status::Action(_) => StatusKind::Action,
            Status::Move(_) => StatusKind::Move,
            Status::Method(_) => StatusKind::Method,
            Status::LabwareThread(_) => StatusKind::LabwareThread,
            Status::Workflow(_) => StatusKind::Workflow,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Action(s) | Status::Move(s) => s.fmt(f),
            Status::Method(s) => s.fmt(f),
            Status::LabwareThread(s) => s.fmt(f),
            Status::Workflow(s) => s.fmt(f),
        }
    }
}

impl From<MethodStatus> for Status {
    fn from(s: MethodStatus) -> Self {
        Status::Method(s)
    }
}

impl From<LabwareThreadStatus> for Status {
    fn from(s: LabwareThreadStatus) -> Self {
        Status::LabwareThread(s)
    }
}

impl From<WorkflowStatus> for Status {
    fn from(s: WorkflowStatus) -> Self {
        Status::Workflow(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub status: Status,
    #[serde(default)]
    pub context: serde_json::Value,
    pub updated_at: String,
}

/// Keyed status store. Every write is followed by a synchronous publish of
/// `KIND.STATUS` and `KIND.id.STATUS` on the event bus.
pub struct StatusManager {
    records: RwLock<HashMap<String, StatusRecord>>,
    bus: Arc<EventBus>,
}

impl Default for StatusManager {
    fn default() -> Self {
        Self::new(Arc::new(EventBus::new()))
    }
}

impl StatusManager {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn set_status(
        &self,
        id: &str,
        status: impl Into<Status>,
        context: serde_json::Value,
    ) -> Result<(), StatusError> {
        let status = status.into();
        let record = StatusRecord {
            status,
            context: context.clone(),
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        {
            let mut records = self
                .records
                .write()
                .map_err(|e| StatusError::Poisoned(e.to_string()))?;
            records.insert(id.to_owned(), record);
        }
        trace!(kind = %status.kind(), id, %status, "status updated");

        let kind = status.kind();
        let name = status.to_string();
        self.bus.publish(&Event {
            name: format!("{kind}.{name}"),
            kind,
            id: id.to_owned(),
            status,
            context: context.clone(),
        })?;
        self.bus.publish(&Event {
            name: format!("{kind}.{id}.{name}"),
            kind,
            id: id.to_owned(),
            status,
            context,
        })
    }

    pub fn get_status(&self, id: &str) -> Result<Option<StatusRecord>, StatusError> {
        let records = self
            .records
            .read()
            .map_err(|e| StatusError::Poisoned(e.to_string()))?;
        Ok(records.get(id).cloned())
    }

    pub fn thread_status(&self, id: &str) -> Result<Option<LabwareThreadStatus>, StatusError> {
        Ok(self.get_status(id)?.and_then(|r| match r.status {
            Status::LabwareThread(s) => Some(s),
            _ => None,
        }))
    }

    pub fn method_status(&self, id: &str) -> Result<Option<MethodStatus>, StatusError> {
        Ok(self.get_status(id)?.and_then(|r| match r.status {
            Status::Method(s) => Some(s),
            _ => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn status_names_are_screaming_snake() {
        assert_eq!(
            LabwareThreadStatus::AwaitingMoveTargetAvailability.to_string(),
            "AWAITING_MOVE_TARGET_AVAILABILITY"
        );
        assert_eq!(StatusKind::LabwareThread.to_string(), "LABWARE_THREAD");
        let json = serde_json::to_string(&MethodStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
    }

    #[test]
    fn set_then_get_returns_latest() {
        let manager = StatusManager::default();
        manager
            .set_status("t1", LabwareThreadStatus::Created, serde_json::Value::Null)
            .unwrap();
        manager
            .set_status("t1", LabwareThreadStatus::Moving, serde_json::json!({"to": "pad_2"}))
            .unwrap();

        let record = manager.get_status("t1").unwrap().unwrap();
        assert_eq!(record.status, Status::LabwareThread(LabwareThreadStatus::Moving));
        assert_eq!(record.context["to"], "pad_2");
        assert_eq!(
            manager.thread_status("t1").unwrap(),
            Some(LabwareThreadStatus::Moving)
        );
        assert_eq!(manager.method_status("t1").unwrap(), None);
        assert!(manager.get_status("missing").unwrap().is_none());
    }

    #[test]
    fn set_status_publishes_both_event_forms() {
        let manager = StatusManager::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for name in ["METHOD.COMPLETED", "METHOD.m1.COMPLETED", "METHOD.m2.COMPLETED"] {
            let seen = Arc::clone(&seen);
            manager
                .bus()
                .subscribe(name, move |event| {
                    seen.lock().unwrap().push(event.name.clone());
                })
                .unwrap();
        }

        manager
            .set_status("m1", MethodStatus::Completed, serde_json::Value::Null)
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec!["METHOD.COMPLETED".to_owned(), "METHOD.m1.COMPLETED".to_owned()]
        );
    }

    #[test]
    fn status_record_is_stored_before_publish() {
        let manager = Arc::new(StatusManager::default());
        let observed = Arc::new(Mutex::new(None));
        let (m, o) = (Arc::clone(&manager), Arc::clone(&observed));
        manager
            .bus()
            .subscribe("WORKFLOW.w.COMPLETED", move |_| {
                *o.lock().unwrap() = m.get_status("w").unwrap().map(|r| r.status);
            })
            .unwrap();

        manager
            .set_status("w", WorkflowStatus::Completed, serde_json::Value::Null)
            .unwrap();
        assert_eq!(
            *observed.lock().unwrap(),
            Some(Status::Workflow(WorkflowStatus::Completed))
        );
    }
}

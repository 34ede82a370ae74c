//! Runtime method and action instances.
//!
//! One `MethodInstance` may be shared by several labware threads of a
//! workflow; its actions then take several labware as inputs and run once,
//! on whichever co-thread observes all inputs loaded first.

use crate::CoreError;
use orca_schema::{
    ActionId, ActionOptions, ActionTemplate, LabwareId, MethodId, ResourceName, TemplateName,
};
use orca_store::{ActionStatus, MethodStatus, Status, StatusManager};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{debug, info};

pub struct ActionInstance {
    id: ActionId,
    method: MethodId,
    index: usize,
    command: String,
    options: ActionOptions,
    resources: Vec<ResourceName>,
    inputs: Vec<LabwareId>,
    binding: Mutex<Option<ResourceName>>,
    state: watch::Sender<ActionStatus>,
    status: Arc<StatusManager>,
}

impl ActionInstance {
    /// `resources` is the single bound resource or every pool member.
    pub fn new(
        method: &MethodId,
        index: usize,
        template: &ActionTemplate,
        resources: Vec<ResourceName>,
        inputs: Vec<LabwareId>,
        status: Arc<StatusManager>,
    ) -> Result<Self, CoreError> {
        if resources.is_empty() {
            return Err(CoreError::InvalidArgument(format!(
                "action {index} of method {method} has no candidate resources"
            )));
        }
        let binding = (resources.len() == 1).then(|| resources[0].clone());
        let (state, _) = watch::channel(ActionStatus::Created);
        let action = Self {
            id: ActionId::generate(),
            method: method.clone(),
            index,
            command: template.command.clone(),
            options: template.options.clone(),
            resources,
            inputs,
            binding: Mutex::new(binding),
            state,
            status,
        };
        action.record(ActionStatus::Created)?;
        Ok(action)
    }

    pub fn id(&self) -> &ActionId {
        &self.id
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn options(&self) -> &ActionOptions {
        &self.options
    }

    pub fn resources(&self) -> &[ResourceName] {
        &self.resources
    }

    /// Labware that must be loaded before the command runs.
    pub fn inputs(&self) -> &[LabwareId] {
        &self.inputs
    }

    pub fn takes(&self, labware: &LabwareId) -> bool {
        self.inputs.contains(labware)
    }

    pub fn bound_resource(&self) -> Option<ResourceName> {
        self.binding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Bind to `resource` unless a co-thread already bound another one.
    /// Returns the binding in effect.
    pub fn bind(&self, resource: &ResourceName) -> ResourceName {
        let mut binding = self.binding.lock().unwrap_or_else(PoisonError::into_inner);
        match binding.as_ref() {
            Some(existing) => existing.clone(),
            None => {
                debug!(action = %self.id, %resource, "action bound");
                *binding = Some(resource.clone());
                resource.clone()
            }
        }
    }

    pub fn status(&self) -> ActionStatus {
        *self.state.borrow()
    }

    /// Advance a not yet executing action; no-op once it has started.
    pub fn advance(&self, next: ActionStatus) -> Result<(), CoreError> {
        let changed = self.state.send_if_modified(|s| {
            let open = !s.is_terminal() && *s != ActionStatus::Executing && *s != next;
            if open {
                *s = next;
            }
            open
        });
        if changed {
            self.record(next)?;
        }
        Ok(())
    }

    /// Claim the right to execute. Exactly one caller ever gets `true`.
    pub fn try_begin(&self) -> Result<bool, CoreError> {
        let began = self.state.send_if_modified(|s| {
            let open = !s.is_terminal() && *s != ActionStatus::Executing;
            if open {
                *s = ActionStatus::Executing;
            }
            open
        });
        if began {
            self.record(ActionStatus::Executing)?;
        }
        Ok(began)
    }

    pub fn finish(&self, succeeded: bool) -> Result<(), CoreError> {
        let target = if succeeded {
            ActionStatus::Completed
        } else {
            ActionStatus::Errored
        };
        let mut prior = None;
        let changed = self.state.send_if_modified(|s| {
            if *s == ActionStatus::Executing {
                *s = target;
                true
            } else {
                prior = Some(*s);
                false
            }
        });
        if !changed {
            return Err(CoreError::ProtocolViolation(format!(
                "action {} finished while {}",
                self.id,
                prior.unwrap_or(target)
            )));
        }
        self.record(target)
    }

    /// Wait until a co-thread finishes executing this action.
    pub async fn wait_finished(&self) -> Result<(), CoreError> {
        let mut rx = self.state.subscribe();
        let status = *rx
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| CoreError::ActionFailed {
                action: self.id.to_string(),
            })?;
        match status {
            ActionStatus::Completed => Ok(()),
            _ => Err(CoreError::ActionFailed {
                action: self.id.to_string(),
            }),
        }
    }

    fn record(&self, status: ActionStatus) -> Result<(), CoreError> {
        self.status.set_status(
            &self.id,
            Status::Action(status),
            json!({
                "method": self.method,
                "index": self.index,
                "command": self.command,
                "resource": self.bound_resource(),
            }),
        )?;
        Ok(())
    }
}

pub struct MethodInstance {
    id: MethodId,
    template: TemplateName,
    actions: Vec<Arc<ActionInstance>>,
    status: Arc<StatusManager>,
    started: AtomicBool,
    finished: AtomicBool,
}

impl MethodInstance {
    pub fn new(
        id: MethodId,
        template: TemplateName,
        actions: Vec<Arc<ActionInstance>>,
        status: Arc<StatusManager>,
    ) -> Result<Self, CoreError> {
        let method = Self {
            id,
            template,
            actions,
            status,
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        };
        method.record(MethodStatus::Created)?;
        Ok(method)
    }

    pub fn id(&self) -> &MethodId {
        &self.id
    }

    pub fn template(&self) -> &TemplateName {
        &self.template
    }

    pub fn actions(&self) -> &[Arc<ActionInstance>] {
        &self.actions
    }

    /// Actions the given labware takes part in, in declared order.
    pub fn actions_for<'a>(
        &'a self,
        labware: &'a LabwareId,
    ) -> impl Iterator<Item = &'a Arc<ActionInstance>> + 'a {
        self.actions.iter().filter(move |a| a.takes(labware))
    }

    pub fn is_completed(&self) -> bool {
        self.actions
            .iter()
            .all(|a| a.status() == ActionStatus::Completed)
    }

    fn first_errored(&self) -> Option<&Arc<ActionInstance>> {
        self.actions
            .iter()
            .find(|a| a.status() == ActionStatus::Errored)
    }

    pub fn mark_started(&self) -> Result<(), CoreError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            self.record(MethodStatus::InProgress)?;
        }
        Ok(())
    }

    /// Record the method outcome once every action is terminal.
    pub fn action_finished(&self) -> Result<(), CoreError> {
        if !self.actions.iter().all(|a| a.status().is_terminal()) {
            return Ok(());
        }
        if self.finished.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.first_errored().is_some() {
            self.record(MethodStatus::Errored)
        } else {
            info!(method = %self.id, template = %self.template, "method completed");
            self.record(MethodStatus::Completed)
        }
    }

    /// Resolve on `METHOD.<id>.COMPLETED`; fail on `METHOD.<id>.ERRORED`.
    pub async fn wait_completed(&self) -> Result<(), CoreError> {
        let bus = self.status.bus();
        let completed = bus.subscribe_once(&format!("METHOD.{}.COMPLETED", self.id))?;
        let errored = bus.subscribe_once(&format!("METHOD.{}.ERRORED", self.id))?;

        if self.finished.load(Ordering::SeqCst) {
            return self.outcome();
        }
        tokio::select! {
            _ = completed => {}
            _ = errored => {}
        }
        self.outcome()
    }

    fn outcome(&self) -> Result<(), CoreError> {
        match self.first_errored() {
            Some(action) => Err(CoreError::ActionFailed {
                action: action.id().to_string(),
            }),
            None => Ok(()),
        }
    }

    fn record(&self, status: MethodStatus) -> Result<(), CoreError> {
        self.status.set_status(
            &self.id,
            status,
            json!({ "template": self.template }),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn method_with(
        status: &Arc<StatusManager>,
        inputs: &[&str],
        actions: usize,
    ) -> Arc<MethodInstance> {
        let id = MethodId::generate();
        let inputs: Vec<LabwareId> = inputs.iter().map(|l| LabwareId::new(*l)).collect();
        let actions = (0..actions)
            .map(|i| {
                Arc::new(
                    ActionInstance::new(
                        &id,
                        i,
                        &ActionTemplate::on_resource("sealer", "seal"),
                        vec![ResourceName::new("sealer")],
                        inputs.clone(),
                        Arc::clone(status),
                    )
                    .unwrap(),
                )
            })
            .collect();
        Arc::new(MethodInstance::new(id, TemplateName::new("seal"), actions, Arc::clone(status)).unwrap())
    }

    #[test]
    fn single_resource_is_prebound() {
        let status = Arc::new(StatusManager::default());
        let method = method_with(&status, &["p1"], 1);
        let action = &method.actions()[0];
        assert_eq!(action.bound_resource().unwrap(), "sealer");
        assert_eq!(action.bind(&ResourceName::new("other")), "sealer");
        assert_eq!(
            status.get_status(action.id()).unwrap().unwrap().status,
            Status::Action(ActionStatus::Created)
        );
    }

    #[test]
    fn pool_binding_goes_to_first_caller() {
        let status = Arc::new(StatusManager::default());
        let action = ActionInstance::new(
            &MethodId::new("m"),
            0,
            &ActionTemplate::on_pool("shakers", "shake"),
            vec![ResourceName::new("s1"), ResourceName::new("s2")],
            vec![LabwareId::new("p1")],
            status,
        )
        .unwrap();
        assert!(action.bound_resource().is_none());
        assert_eq!(action.bind(&ResourceName::new("s2")), "s2");
        assert_eq!(action.bind(&ResourceName::new("s1")), "s2");
    }

    #[test]
    fn only_one_caller_begins_and_double_finish_fails() {
        let status = Arc::new(StatusManager::default());
        let method = method_with(&status, &["p1", "p2"], 1);
        let action = &method.actions()[0];

        assert!(action.try_begin().unwrap());
        assert!(!action.try_begin().unwrap());
        action.advance(ActionStatus::AwaitingCoThreads).unwrap();
        assert_eq!(action.status(), ActionStatus::Executing);

        action.finish(true).unwrap();
        assert!(matches!(
            action.finish(true),
            Err(CoreError::ProtocolViolation(_))
        ));
        assert!(!action.try_begin().unwrap());
    }

    #[tokio::test]
    async fn co_thread_waits_for_execution() {
        let status = Arc::new(StatusManager::default());
        let method = method_with(&status, &["p1", "p2"], 1);
        let action = Arc::clone(&method.actions()[0]);

        assert!(action.try_begin().unwrap());
        let waiter = {
            let action = Arc::clone(&action);
            tokio::spawn(async move { action.wait_finished().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        action.finish(true).unwrap();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn method_completes_after_all_actions() {
        let status = Arc::new(StatusManager::default());
        let method = method_with(&status, &["p1"], 2);
        method.mark_started().unwrap();
        assert_eq!(
            status.method_status(method.id()).unwrap(),
            Some(MethodStatus::InProgress)
        );

        let waiter = {
            let method = Arc::clone(&method);
            tokio::spawn(async move { method.wait_completed().await })
        };
        for action in method.actions() {
            action.try_begin().unwrap();
            action.finish(true).unwrap();
            method.action_finished().unwrap();
        }
        waiter.await.unwrap().unwrap();
        assert!(method.is_completed());
        assert_eq!(
            status.method_status(method.id()).unwrap(),
            Some(MethodStatus::Completed)
        );
        // Already finished: returns without waiting.
        method.wait_completed().await.unwrap();
    }

    #[tokio::test]
    async fn errored_action_fails_the_method() {
        let status = Arc::new(StatusManager::default());
        let method = method_with(&status, &["p1"], 1);
        let action = &method.actions()[0];
        action.try_begin().unwrap();
        action.finish(false).unwrap();
        method.action_finished().unwrap();

        assert_eq!(
            status.method_status(method.id()).unwrap(),
            Some(MethodStatus::Errored)
        );
        assert!(matches!(
            method.wait_completed().await,
            Err(CoreError::ActionFailed { .. })
        ));
        assert!(action.wait_finished().await.is_err());
    }

    #[test]
    fn actions_for_filters_by_input() {
        let status = Arc::new(StatusManager::default());
        let method = method_with(&status, &["p1"], 2);
        assert_eq!(method.actions_for(&LabwareId::new("p1")).count(), 2);
        assert_eq!(method.actions_for(&LabwareId::new("p9")).count(), 0);
    }
}

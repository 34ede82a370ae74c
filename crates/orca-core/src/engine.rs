use crate::context::{OrcaContext, SchedulerOptions};
use crate::coordinator::TickLoop;
use crate::method::{ActionInstance, MethodInstance};
use crate::system_map::SystemMap;
use crate::thread::LabwareThread;
use crate::CoreError;
use orca_runtime::{select_driver, Capability, ResourceRegistry};
use orca_schema::{
    ActionBinding, ActionTemplate, LabConfigV1, LabwareId, LabwareSection, LocationName,
    MethodId, MethodTemplate, ResourceName, TemplateName, ThreadTemplate, WorkflowId,
    WorkflowTemplate,
};
use orca_store::{LabwareThreadStatus, StatusManager, StatusRecord, WorkflowStatus};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Assembles the location graph, drivers, and templates once, then starts
/// the reservation tick loop in `build`.
pub struct EngineBuilder {
    map: SystemMap,
    registry: ResourceRegistry,
    status: Arc<StatusManager>,
    options: SchedulerOptions,
    templates: Templates,
}

#[derive(Default)]
struct Templates {
    pools: BTreeMap<TemplateName, Vec<ResourceName>>,
    labware: BTreeMap<TemplateName, LabwareSection>,
    methods: BTreeMap<TemplateName, MethodTemplate>,
    threads: BTreeMap<TemplateName, ThreadTemplate>,
    workflows: BTreeMap<TemplateName, WorkflowTemplate>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            map: SystemMap::new(),
            registry: ResourceRegistry::new(),
            status: Arc::new(StatusManager::default()),
            options: SchedulerOptions::default(),
            templates: Templates::default(),
        }
    }

    /// Validate a lab config and load everything it declares.
    pub fn from_config(config: &LabConfigV1) -> Result<Self, CoreError> {
        config.validate()?;
        let mut builder = Self::new().with_options(SchedulerOptions::from(&config.scheduler));

        for location in &config.locations {
            builder.add_location(location.name.clone(), location.resource.clone())?;
        }
        for resource in &config.resources {
            builder.add_resource(select_driver(resource)?)?;
        }
        for (name, pool) in &config.resource_pools {
            builder.add_pool(name.clone(), pool.resources.clone());
        }
        for (name, labware) in &config.labware {
            builder.add_labware(name.clone(), labware.clone());
        }
        for (name, method) in &config.methods {
            builder.add_method(name.clone(), method.clone());
        }
        for (name, thread) in &config.threads {
            builder.add_thread(name.clone(), thread.clone());
        }
        for (name, workflow) in &config.workflows {
            builder.add_workflow(name.clone(), workflow.clone());
        }
        debug!(
            system = %config.system.name,
            locations = builder.map.len(),
            "lab config loaded"
        );
        Ok(builder)
    }

    #[must_use]
    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: Arc<StatusManager>) -> Self {
        self.status = status;
        self
    }

    pub fn add_location(
        &mut self,
        name: impl Into<LocationName>,
        resource: Option<ResourceName>,
    ) -> Result<&mut Self, CoreError> {
        self.map.add_location(name, resource)?;
        Ok(self)
    }

    /// Register a driver. Transporters also connect their taught positions.
    pub fn add_resource(&mut self, capability: Capability) -> Result<&mut Self, CoreError> {
        if let Capability::Transporter(transporter) = &capability {
            let name = ResourceName::new(capability.name());
            self.map
                .add_transporter(&name, &transporter.taught_positions())?;
        }
        self.registry.register(capability)?;
        Ok(self)
    }

    pub fn add_pool(&mut self, name: impl Into<TemplateName>, members: Vec<ResourceName>) -> &mut Self {
        self.templates.pools.insert(name.into(), members);
        self
    }

    pub fn add_labware(&mut self, name: impl Into<TemplateName>, labware: LabwareSection) -> &mut Self {
        self.templates.labware.insert(name.into(), labware);
        self
    }

    pub fn add_method(&mut self, name: impl Into<TemplateName>, method: MethodTemplate) -> &mut Self {
        self.templates.methods.insert(name.into(), method);
        self
    }

    pub fn add_thread(&mut self, name: impl Into<TemplateName>, thread: ThreadTemplate) -> &mut Self {
        self.templates.threads.insert(name.into(), thread);
        self
    }

    pub fn add_workflow(
        &mut self,
        name: impl Into<TemplateName>,
        workflow: WorkflowTemplate,
    ) -> &mut Self {
        self.templates.workflows.insert(name.into(), workflow);
        self
    }

    /// Initialize every driver and start the reservation tick loop.
    pub async fn build(self) -> Result<Engine, CoreError> {
        self.registry.initialize_all().await?;
        let ctx = Arc::new(OrcaContext::new(
            self.map,
            self.registry,
            self.status,
            self.options,
        ));
        let tick_loop = ctx.coordinator.start_tick_loop(ctx.options.tick_interval);
        info!(
            locations = ctx.map.len(),
            methods = self.templates.methods.len(),
            threads = self.templates.threads.len(),
            workflows = self.templates.workflows.len(),
            "engine ready"
        );
        Ok(Engine {
            ctx,
            templates: self.templates,
            threads: Mutex::new(Vec::new()),
            tick_loop: Mutex::new(Some(tick_loop)),
        })
    }
}

/// Threads created together from one workflow template.
#[derive(Debug)]
pub struct WorkflowRun {
    pub id: WorkflowId,
    pub template: TemplateName,
    pub threads: Vec<Arc<LabwareThread>>,
}

/// Central orchestration engine for Orca labware runs.
///
/// Instantiates labware threads from templates, stages their labware, and
/// drives them concurrently against the shared reservation coordinator.
pub struct Engine {
    ctx: Arc<OrcaContext>,
    templates: Templates,
    threads: Mutex<Vec<Arc<LabwareThread>>>,
    tick_loop: Mutex<Option<TickLoop>>,
}

struct Participant<'a> {
    template: &'a ThreadTemplate,
    labware: LabwareId,
}

impl Engine {
    pub fn context(&self) -> &Arc<OrcaContext> {
        &self.ctx
    }

    /// Every thread created so far.
    pub fn threads(&self) -> Vec<Arc<LabwareThread>> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status(&self, id: &str) -> Result<Option<StatusRecord>, CoreError> {
        Ok(self.ctx.status.get_status(id)?)
    }

    /// Instantiate one thread template with its own method instances and
    /// stage its labware at the start location.
    pub fn create_thread(&self, template: &str) -> Result<Arc<LabwareThread>, CoreError> {
        let thread = self.thread_template(template)?;
        let mut created = self.instantiate(&[thread])?;
        created
            .pop()
            .ok_or_else(|| CoreError::ProtocolViolation("thread was not created".to_owned()))
    }

    /// Instantiate every thread of a workflow. Threads listing the same
    /// method share one method instance.
    pub fn create_workflow(&self, template: &str) -> Result<WorkflowRun, CoreError> {
        let workflow = self
            .templates
            .workflows
            .get(template)
            .ok_or_else(|| CoreError::NotFound(format!("workflow template '{template}'")))?;
        let thread_templates = workflow
            .threads
            .iter()
            .map(|name| self.thread_template(name))
            .collect::<Result<Vec<_>, _>>()?;
        let threads = self.instantiate(&thread_templates)?;

        let run = WorkflowRun {
            id: WorkflowId::generate(),
            template: TemplateName::new(template),
            threads,
        };
        self.record_workflow(&run, WorkflowStatus::Created)?;
        info!(workflow = %run.id, template, threads = run.threads.len(), "workflow created");
        Ok(run)
    }

    /// Run a single method template on a fresh labware, outside any workflow.
    pub async fn run_method(
        &self,
        method: &str,
        labware_template: &str,
        start: impl Into<LocationName>,
        end: impl Into<LocationName>,
    ) -> Result<LabwareThreadStatus, CoreError> {
        if !self.templates.labware.contains_key(labware_template) {
            return Err(CoreError::NotFound(format!(
                "labware template '{labware_template}'"
            )));
        }
        let template =
            ThreadTemplate::new(labware_template, start, end).with_methods([method]);
        let thread = self
            .instantiate(&[&template])?
            .pop()
            .ok_or_else(|| CoreError::ProtocolViolation("thread was not created".to_owned()))?;
        self.run_thread(&thread).await
    }

    pub async fn run_thread(
        &self,
        thread: &Arc<LabwareThread>,
    ) -> Result<LabwareThreadStatus, CoreError> {
        thread.start().await?
    }

    /// Run every thread of a workflow concurrently and wait for all of them.
    ///
    /// The first thread error stops the remaining threads and is returned
    /// once they have all finished.
    pub async fn run_workflow(&self, run: &WorkflowRun) -> Result<WorkflowStatus, CoreError> {
        self.record_workflow(run, WorkflowStatus::Running)?;
        info!(workflow = %run.id, template = %run.template, "workflow running");

        let mut tasks = JoinSet::new();
        for thread in &run.threads {
            let thread = Arc::clone(thread);
            tasks.spawn(async move { thread.run().await });
        }

        let mut first_error: Option<CoreError> = None;
        let mut stopped = false;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(CoreError::from).and_then(|result| result) {
                Ok(LabwareThreadStatus::Stopped) => stopped = true,
                Ok(_) => {}
                Err(e) => {
                    if first_error.is_none() {
                        warn!(workflow = %run.id, "stopping workflow threads after error: {e}");
                        for thread in &run.threads {
                            thread.stop();
                        }
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            self.record_workflow(run, WorkflowStatus::Errored)?;
            return Err(e);
        }
        let status = if stopped {
            WorkflowStatus::Stopped
        } else {
            WorkflowStatus::Completed
        };
        self.record_workflow(run, status)?;
        info!(workflow = %run.id, %status, "workflow finished");
        Ok(status)
    }

    /// Ask every thread to stop at its next hop or action boundary.
    pub fn stop_all(&self) {
        for thread in self.threads() {
            thread.stop();
        }
    }

    /// Stop all threads and the reservation tick loop.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.stop_all();
        let tick_loop = self
            .tick_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tick_loop) = tick_loop {
            tick_loop.stop().await?;
        }
        info!("engine shut down");
        Ok(())
    }

    fn thread_template(&self, name: &str) -> Result<&ThreadTemplate, CoreError> {
        self.templates
            .threads
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("thread template '{name}'")))
    }

    fn instantiate(
        &self,
        templates: &[&ThreadTemplate],
    ) -> Result<Vec<Arc<LabwareThread>>, CoreError> {
        self.check_starts(templates)?;
        let participants: Vec<Participant<'_>> = templates
            .iter()
            .map(|&template| Participant {
                template,
                labware: LabwareId::generate(),
            })
            .collect();

        let mut methods: BTreeMap<&TemplateName, Arc<MethodInstance>> = BTreeMap::new();
        for participant in &participants {
            for name in &participant.template.methods {
                if !methods.contains_key(name) {
                    let method = self.instantiate_method(name, &participants)?;
                    methods.insert(name, Arc::new(method));
                }
            }
        }

        let mut threads = Vec::with_capacity(participants.len());
        for participant in participants {
            let template = participant.template;
            self.stage(&template.start, &participant.labware)?;
            let thread_methods = template
                .methods
                .iter()
                .filter_map(|name| methods.get(name).cloned())
                .collect();
            let thread = Arc::new(LabwareThread::new(
                Arc::clone(&self.ctx),
                template.labware.clone(),
                participant.labware,
                template.start.clone(),
                template.end.clone(),
                thread_methods,
            )?);
            debug!(
                thread = %thread.id(),
                labware = %thread.labware(),
                start = %template.start,
                "thread created"
            );
            threads.push(thread);
        }

        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(threads.iter().cloned());
        Ok(threads)
    }

    /// Start locations must exist, be distinct, and be free.
    fn check_starts(&self, templates: &[&ThreadTemplate]) -> Result<(), CoreError> {
        let mut seen = HashSet::new();
        for template in templates {
            let start = &template.start;
            let location = self.ctx.map.get_location(start)?;
            self.ctx.map.get_location(&template.end)?;
            if !seen.insert(start) {
                return Err(CoreError::InvalidArgument(format!(
                    "two threads start on location '{start}'"
                )));
            }
            if location.is_occupied() || self.ctx.reservations.is_reserved(start) {
                return Err(CoreError::InvalidArgument(format!(
                    "start location '{start}' is not free"
                )));
            }
        }
        Ok(())
    }

    fn stage(&self, start: &LocationName, labware: &LabwareId) -> Result<(), CoreError> {
        self.ctx.reservations.place_initial(start, labware)?;
        if let Some(resource) = self.ctx.map.get_location(start)?.resource() {
            self.ctx.registry.instrument(resource)?.notify_placed(labware)?;
        }
        Ok(())
    }

    fn instantiate_method(
        &self,
        name: &TemplateName,
        participants: &[Participant<'_>],
    ) -> Result<MethodInstance, CoreError> {
        let template = self
            .templates
            .methods
            .get(name)
            .ok_or_else(|| CoreError::NotFound(format!("method template '{name}'")))?;
        let members: Vec<&Participant<'_>> = participants
            .iter()
            .filter(|p| p.template.methods.contains(name))
            .collect();

        let id = MethodId::generate();
        let mut actions = Vec::with_capacity(template.actions.len());
        for (index, action) in template.actions.iter().enumerate() {
            let resources = self.action_resources(name, index, action)?;
            let inputs: Vec<LabwareId> = members
                .iter()
                .filter(|p| action.takes_input(&p.template.labware))
                .map(|p| p.labware.clone())
                .collect();
            if inputs.is_empty() {
                return Err(CoreError::InvalidArgument(format!(
                    "action {index} of method '{name}' has no participating labware"
                )));
            }
            self.check_capacity(name, index, &resources, inputs.len())?;
            actions.push(Arc::new(ActionInstance::new(
                &id,
                index,
                action,
                resources,
                inputs,
                Arc::clone(&self.ctx.status),
            )?));
        }

        for member in &members {
            if !actions.iter().any(|a| a.takes(&member.labware)) {
                return Err(CoreError::InvalidArgument(format!(
                    "labware template '{}' takes part in no action of method '{name}'",
                    member.template.labware
                )));
            }
        }
        MethodInstance::new(id, name.clone(), actions, Arc::clone(&self.ctx.status))
    }

    fn action_resources(
        &self,
        method: &TemplateName,
        index: usize,
        action: &ActionTemplate,
    ) -> Result<Vec<ResourceName>, CoreError> {
        match action.binding(method, index)? {
            ActionBinding::Resource(resource) => Ok(vec![resource.clone()]),
            ActionBinding::Pool(pool) => self
                .templates
                .pools
                .get(pool)
                .cloned()
                .ok_or_else(|| CoreError::NotFound(format!("resource pool '{pool}'"))),
        }
    }

    /// Every candidate resource needs a deck position per input labware.
    fn check_capacity(
        &self,
        method: &TemplateName,
        index: usize,
        resources: &[ResourceName],
        inputs: usize,
    ) -> Result<(), CoreError> {
        for resource in resources {
            let positions = self.ctx.map.get_resource_locations(resource).len();
            if positions < inputs {
                return Err(CoreError::InvalidArgument(format!(
                    "action {index} of method '{method}' takes {inputs} labware \
                     but resource '{resource}' has {positions} locations"
                )));
            }
        }
        Ok(())
    }

    fn record_workflow(&self, run: &WorkflowRun, status: WorkflowStatus) -> Result<(), CoreError> {
        let threads: Vec<&str> = run.threads.iter().map(|t| t.id().as_str()).collect();
        self.ctx.status.set_status(
            &run.id,
            status,
            json!({ "template": run.template, "threads": threads }),
        )?;
        Ok(())
    }
}

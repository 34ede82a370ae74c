//! Immutable workflow authoring data: methods, actions, threads, workflows.

use crate::config::ConfigError;
use crate::types::{LocationName, ResourceName, TemplateName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type ActionOptions = BTreeMap<String, serde_json::Value>;

/// One unresolved method step.
///
/// Bound either to a single named resource or to a pool of interchangeable
/// resources; the pool is narrowed to one concrete location at run time.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ActionTemplate {
    #[serde(default)]
    pub resource: Option<ResourceName>,
    #[serde(default)]
    pub pool: Option<TemplateName>,
    pub command: String,
    #[serde(default)]
    pub options: ActionOptions,
    /// Labware templates that must be loaded before the command runs.
    /// Empty means every labware whose thread runs the method.
    #[serde(default)]
    pub inputs: Vec<TemplateName>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionBinding<'a> {
    Resource(&'a ResourceName),
    Pool(&'a TemplateName),
}

impl ActionTemplate {
    pub fn on_resource(resource: impl Into<ResourceName>, command: impl Into<String>) -> Self {
        Self {
            resource: Some(resource.into()),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn on_pool(pool: impl Into<TemplateName>, command: impl Into<String>) -> Self {
        Self {
            pool: Some(pool.into()),
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_inputs<I, T>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TemplateName>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_option(mut self, key: &str, value: serde_json::Value) -> Self {
        self.options.insert(key.to_owned(), value);
        self
    }

    pub fn binding(&self, method: &str, index: usize) -> Result<ActionBinding<'_>, ConfigError> {
        match (&self.resource, &self.pool) {
            (Some(resource), None) => Ok(ActionBinding::Resource(resource)),
            (None, Some(pool)) => Ok(ActionBinding::Pool(pool)),
            _ => Err(ConfigError::AmbiguousBinding {
                method: method.to_owned(),
                index,
            }),
        }
    }

    /// Whether a labware of the given template takes part in this action.
    pub fn takes_input(&self, labware_template: &str) -> bool {
        self.inputs.is_empty() || self.inputs.iter().any(|t| t == labware_template)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MethodTemplate {
    pub actions: Vec<ActionTemplate>,
}

impl MethodTemplate {
    pub fn new(actions: Vec<ActionTemplate>) -> Self {
        Self { actions }
    }
}

/// Route of one labware: start, ordered methods, end.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ThreadTemplate {
    pub labware: TemplateName,
    pub start: LocationName,
    pub end: LocationName,
    #[serde(default)]
    pub methods: Vec<TemplateName>,
}

impl ThreadTemplate {
    pub fn new(
        labware: impl Into<TemplateName>,
        start: impl Into<LocationName>,
        end: impl Into<LocationName>,
    ) -> Self {
        Self {
            labware: labware.into(),
            start: start.into(),
            end: end.into(),
            methods: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_methods<I, T>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TemplateName>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }
}

/// A set of threads started together. Threads that list the same method
/// share one method instance, which is how multi-labware actions join.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowTemplate {
    pub threads: Vec<TemplateName>,
}

use crate::templates::{MethodTemplate, ThreadTemplate, WorkflowTemplate};
use crate::types::{LocationName, ResourceName, TemplateName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read lab config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse lab config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("unsupported config_version: {0}, expected 1")]
    UnsupportedVersion(u32),
    #[error("{0} name must not be empty")]
    EmptyName(&'static str),
    #[error("location '{0}' is declared more than once")]
    DuplicateLocation(String),
    #[error("resource '{0}' is declared more than once")]
    DuplicateResource(String),
    #[error("{context} references unknown {kind} '{name}'")]
    UnknownReference {
        kind: &'static str,
        name: String,
        context: String,
    },
    #[error("resource '{0}' is not an instrument")]
    NotAnInstrument(String),
    #[error("instrument '{0}' has no location")]
    InstrumentWithoutLocation(String),
    #[error("action {index} of method '{method}' must name exactly one of `resource` or `pool`")]
    AmbiguousBinding { method: String, index: usize },
    #[error("invalid scheduler setting: {0}")]
    InvalidScheduler(String),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct LabConfigV1 {
    pub config_version: u32,
    #[serde(default)]
    pub system: SystemSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default, rename = "location")]
    pub locations: Vec<LocationSection>,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceSection>,
    #[serde(default, rename = "resource_pool")]
    pub resource_pools: BTreeMap<TemplateName, ResourcePoolSection>,
    #[serde(default)]
    pub labware: BTreeMap<TemplateName, LabwareSection>,
    #[serde(default, rename = "method")]
    pub methods: BTreeMap<TemplateName, MethodTemplate>,
    #[serde(default, rename = "thread")]
    pub threads: BTreeMap<TemplateName, ThreadTemplate>,
    #[serde(default, rename = "workflow")]
    pub workflows: BTreeMap<TemplateName, WorkflowTemplate>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SystemSection {
    #[serde(default = "default_system_name")]
    pub name: String,
}

impl Default for SystemSection {
    fn default() -> Self {
        Self {
            name: default_system_name(),
        }
    }
}

/// Timing knobs for the reservation coordinator and retry loops.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Fraction of `retry_backoff_ms` added or subtracted at random.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_availability_poll_ms")]
    pub availability_poll_ms: u64,
    /// Unset means contested reservations retry forever.
    #[serde(default)]
    pub max_reservation_attempts: Option<u32>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            backoff_jitter: default_backoff_jitter(),
            availability_poll_ms: default_availability_poll_ms(),
            max_reservation_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LocationSection {
    pub name: LocationName,
    /// Instrument hosted at this teachpoint. Plain parking pads leave this unset.
    #[serde(default)]
    pub resource: Option<ResourceName>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Instrument,
    Transporter,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceSection {
    pub name: ResourceName,
    pub kind: ResourceKind,
    #[serde(default = "default_driver")]
    pub driver: String,
    /// Taught positions; only meaningful for transporters.
    #[serde(default)]
    pub positions: Vec<LocationName>,
    /// Simulated duration of every driver call.
    #[serde(default)]
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourcePoolSection {
    pub resources: Vec<ResourceName>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LabwareSection {
    #[serde(rename = "type", default)]
    pub labware_type: String,
}

impl LabConfigV1 {
    pub fn resource(&self, name: &str) -> Option<&ResourceSection> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn location(&self, name: &str) -> Option<&LocationSection> {
        self.locations.iter().find(|l| l.name == name)
    }

    /// Locations hosting the given instrument, in declaration order.
    pub fn locations_of(&self, resource: &str) -> impl Iterator<Item = &LocationSection> {
        let resource = resource.to_owned();
        self.locations
            .iter()
            .filter(move |l| l.resource.as_deref() == Some(resource.as_str()))
    }
}

fn default_system_name() -> String {
    "orca".to_owned()
}

fn default_driver() -> String {
    "mock".to_owned()
}

fn default_tick_interval_ms() -> u64 {
    300
}

fn default_retry_backoff_ms() -> u64 {
    200
}

fn default_backoff_jitter() -> f64 {
    0.25
}

fn default_availability_poll_ms() -> u64 {
    50
}

pub fn parse_config_str(input: &str) -> Result<LabConfigV1, ConfigError> {
    Ok(toml::from_str(input)?)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<LabConfigV1, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

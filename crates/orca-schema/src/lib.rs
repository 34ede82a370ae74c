//! Lab configuration, workflow templates, and identifiers for Orca.
//!
//! This crate defines the schema layer: TOML lab configuration parsing
//! (`LabConfigV1`) with cross-reference validation, the immutable method,
//! thread, and workflow templates that authoring tools produce, and the
//! string newtypes used to name locations, resources, and runtime entities.

pub mod config;
pub mod templates;
pub mod types;
pub mod validate;

pub use config::{
    parse_config_file, parse_config_str, ConfigError, LabConfigV1, LabwareSection,
    LocationSection, ResourceKind, ResourcePoolSection, ResourceSection, SchedulerSection,
    SystemSection,
};
pub use templates::{
    ActionBinding, ActionOptions, ActionTemplate, MethodTemplate, ThreadTemplate,
    WorkflowTemplate,
};
pub use types::{
    ActionId, LabwareId, LocationName, MethodId, ResourceName, TemplateName, ThreadId,
    WorkflowId,
};

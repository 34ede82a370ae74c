//! Cross-reference validation of a parsed lab configuration.
//!
//! Parsing only checks shape. Everything that names something else (a
//! location naming its instrument, a thread naming its methods, a pool naming
//! its members) is checked here, so that the engine can treat every lookup
//! against a validated config as infallible.

use crate::config::{ConfigError, LabConfigV1, ResourceKind};
use crate::templates::ActionBinding;
use std::collections::HashSet;

impl LabConfigV1 {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.config_version != 1 {
            return Err(ConfigError::UnsupportedVersion(self.config_version));
        }
        self.validate_scheduler()?;
        self.validate_layout()?;
        self.validate_templates()
    }

    fn validate_scheduler(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidScheduler(
                "tick_interval_ms must be positive".to_owned(),
            ));
        }
        if s.availability_poll_ms == 0 {
            return Err(ConfigError::InvalidScheduler(
                "availability_poll_ms must be positive".to_owned(),
            ));
        }
        if !(0.0..1.0).contains(&s.backoff_jitter) {
            return Err(ConfigError::InvalidScheduler(format!(
                "backoff_jitter must be in [0, 1), got {}",
                s.backoff_jitter
            )));
        }
        if s.max_reservation_attempts == Some(0) {
            return Err(ConfigError::InvalidScheduler(
                "max_reservation_attempts must be positive when set".to_owned(),
            ));
        }
        Ok(())
    }

    fn validate_layout(&self) -> Result<(), ConfigError> {
        let mut resources = HashSet::new();
        for resource in &self.resources {
            if resource.name.is_empty() {
                return Err(ConfigError::EmptyName("resource"));
            }
            if !resources.insert(resource.name.as_str()) {
                return Err(ConfigError::DuplicateResource(resource.name.to_string()));
            }
        }

        let mut locations = HashSet::new();
        for location in &self.locations {
            if location.name.is_empty() {
                return Err(ConfigError::EmptyName("location"));
            }
            if !locations.insert(location.name.as_str()) {
                return Err(ConfigError::DuplicateLocation(location.name.to_string()));
            }
            if let Some(resource) = &location.resource {
                self.require_instrument(resource, &format!("location '{}'", location.name))?;
            }
        }

        for resource in &self.resources {
            match resource.kind {
                ResourceKind::Transporter => {
                    for position in &resource.positions {
                        if !locations.contains(position.as_str()) {
                            return Err(ConfigError::UnknownReference {
                                kind: "location",
                                name: position.to_string(),
                                context: format!("transporter '{}'", resource.name),
                            });
                        }
                    }
                }
                ResourceKind::Instrument => {
                    if self.locations_of(&resource.name).next().is_none() {
                        return Err(ConfigError::InstrumentWithoutLocation(
                            resource.name.to_string(),
                        ));
                    }
                }
            }
        }

        for (pool_name, pool) in &self.resource_pools {
            for member in &pool.resources {
                self.require_instrument(member, &format!("resource pool '{pool_name}'"))?;
            }
        }
        Ok(())
    }

    fn validate_templates(&self) -> Result<(), ConfigError> {
        for (method_name, method) in &self.methods {
            for (index, action) in method.actions.iter().enumerate() {
                let context = format!("action {index} of method '{method_name}'");
                match action.binding(method_name, index)? {
                    ActionBinding::Resource(resource) => {
                        self.require_instrument(resource, &context)?;
                    }
                    ActionBinding::Pool(pool) => {
                        if !self.resource_pools.contains_key(pool) {
                            return Err(unknown("resource pool", pool, &context));
                        }
                    }
                }
                for input in &action.inputs {
                    if !self.labware.contains_key(input) {
                        return Err(unknown("labware", input, &context));
                    }
                }
            }
        }

        for (thread_name, thread) in &self.threads {
            let context = format!("thread '{thread_name}'");
            if !self.labware.contains_key(&thread.labware) {
                return Err(unknown("labware", &thread.labware, &context));
            }
            for location in [&thread.start, &thread.end] {
                if self.location(location).is_none() {
                    return Err(unknown("location", location, &context));
                }
            }
            for method in &thread.methods {
                if !self.methods.contains_key(method) {
                    return Err(unknown("method", method, &context));
                }
            }
        }

        for (workflow_name, workflow) in &self.workflows {
            for thread in &workflow.threads {
                if !self.threads.contains_key(thread) {
                    return Err(unknown(
                        "thread",
                        thread,
                        &format!("workflow '{workflow_name}'"),
                    ));
                }
            }
        }
        Ok(())
    }

    fn require_instrument(&self, name: &str, context: &str) -> Result<(), ConfigError> {
        match self.resource(name) {
            Some(r) if r.kind == ResourceKind::Instrument => Ok(()),
            Some(_) => Err(ConfigError::NotAnInstrument(name.to_owned())),
            None => Err(unknown("resource", name, context)),
        }
    }
}

fn unknown(kind: &'static str, name: &str, context: &str) -> ConfigError {
    ConfigError::UnknownReference {
        kind,
        name: name.to_owned(),
        context: context.to_owned(),
    }
}

//! Identifier newtypes. Each wraps a `String` and serializes as one, so a
//! location name in a config file or status record reads as plain text.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        // Keyed maps are queried with `&str`.
        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

macro_rules! generated_id {
    ($name:ident, $prefix:literal) => {
        impl $name {
            /// Generate a fresh, globally unique identifier.
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "-{}"), uuid::Uuid::new_v4().simple()))
            }
        }
    };
}

string_newtype!(
    /// Unique name of a teachpoint in the lab layout.
    LocationName
);

string_newtype!(
    /// Name of an instrument or transporter resource.
    ResourceName
);

string_newtype!(
    /// Name of a template (labware, method, thread, workflow, resource pool).
    TemplateName
);

string_newtype!(
    /// Runtime identity of one physical labware item.
    LabwareId
);

string_newtype!(
    /// Runtime identity of one executing labware thread.
    ThreadId
);

string_newtype!(
    /// Runtime identity of one method instance.
    MethodId
);

string_newtype!(
    /// Runtime identity of one action or move.
    ActionId
);

string_newtype!(
    /// Runtime identity of one workflow run.
    WorkflowId
);

generated_id!(LabwareId, "lw");
generated_id!(ThreadId, "thread");
generated_id!(MethodId, "method");
generated_id!(ActionId, "action");
generated_id!(WorkflowId, "workflow");

//! Stable identifiers for the engine's owned entities. Each is a thin
//! newtype over a UUID string so session/tab/playbook/history ids can't be
//! swapped at a call site by accident, mirroring the `SessionId` newtype
//! the upstream session core uses.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

id_type!(SessionId);
id_type!(TabId);
id_type!(PlaybookId);
id_type!(LogEntryId);
id_type!(HistoryEntryId);
id_type!(ExecutionQueueItemId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = TabId::from("tab-123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"tab-123\"");
    }
}

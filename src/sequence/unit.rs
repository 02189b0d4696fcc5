use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Stable identity of a unit, independent of its current position in the sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One schedulable acquisition
///
/// The scheduler only looks at `id` and `name`; `settings` is carried through to the
/// engine untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    id: UnitId,
    pub name: String,
    pub settings: Value,
}

impl Unit {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, Value::Null)
    }

    pub fn with_settings(name: impl Into<String>, settings: Value) -> Self {
        Self {
            id: UnitId::new(),
            name: name.into(),
            settings,
        }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }
}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::core::Value;

/// Identity of one stored object: entity kind plus a key that is temporary
/// until the first save that reaches a store assigns a permanent one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: ObjectKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKey {
    Temporary(Uuid),
    Permanent(u64),
}

impl ObjectId {
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: ObjectKey::Temporary(Uuid::new_v4()),
        }
    }

    pub fn permanent(entity: impl Into<String>, key: u64) -> Self {
        Self {
            entity: entity.into(),
            key: ObjectKey::Permanent(key),
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self.key, ObjectKey::Temporary(_))
    }

    /// Same entity, permanent key. Used when a store assigns identities
    /// during commit.
    pub fn with_permanent_key(&self, key: u64) -> Self {
        Self {
            entity: self.entity.clone(),
            key: ObjectKey::Permanent(key),
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key {
            ObjectKey::Temporary(uuid) => write!(f, "{}/t-{}", self.entity, uuid),
            ObjectKey::Permanent(key) => write!(f, "{}/{}", self.entity, key),
        }
    }
}

/// Attribute values of one object, keyed by attribute name. Attributes that
/// were never set are simply absent and read back as `Value::Null`.
pub type ObjectData = HashMap<String, Value>;

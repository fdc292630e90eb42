use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{ObjectData, Result, StackError, StoreError, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeKind {
    Integer,
    Float,
    Text,
    Boolean,
    DateTime,
    Uuid,
}

impl AttributeKind {
    pub fn is_compatible(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Integer, Value::Integer(_)) => true,
            (Self::Float, Value::Float(_)) => true,
            (Self::Float, Value::Integer(_)) => true, // Integer widens to Float
            (Self::Text, Value::Text(_)) => true,
            (Self::Boolean, Value::Boolean(_)) => true,
            (Self::DateTime, Value::DateTime(_)) => true,
            (Self::Uuid, Value::Uuid(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer => write!(f, "INTEGER"),
            Self::Float => write!(f, "FLOAT"),
            Self::Text => write!(f, "TEXT"),
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::DateTime => write!(f, "DATETIME"),
            Self::Uuid => write!(f, "UUID"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub kind: AttributeKind,
    pub optional: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: true,
        }
    }

    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    pub fn validate(&self, value: &Value) -> std::result::Result<(), StoreError> {
        if value.is_null() {
            if !self.optional {
                return Err(StoreError::Validation(format!(
                    "Attribute '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }
        if !self.kind.is_compatible(value) {
            return Err(StoreError::Validation(format!(
                "Attribute '{}' expects type {}, got {}",
                self.name,
                self.kind,
                value.type_name()
            )));
        }
        Ok(())
    }
}

/// To-one relationship to another entity kind. To-many fan-out belongs to
/// the host storage engine and is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub destination: String,
}

impl Relationship {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
        }
    }
}

/// Persisted-entity description for one entity kind: attributes, to-one
/// relationships, and an optional parent kind (sub-kind support).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    name: String,
    parent: Option<String>,
    attributes: Vec<Attribute>,
    relationships: Vec<Relationship>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.push(Attribute::new(name, kind));
        self
    }

    pub fn required_attribute(mut self, name: impl Into<String>, kind: AttributeKind) -> Self {
        self.attributes.push(Attribute::new(name, kind).required());
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, destination: impl Into<String>) -> Self {
        self.relationships.push(Relationship::new(name, destination));
        self
    }

    pub fn parent_kind(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn find_attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Flatten a parent kind's attributes and relationships into this schema.
    /// Own declarations win on name clashes.
    pub fn merged_with_parent(&self, parent: &EntitySchema) -> EntitySchema {
        let mut merged = self.clone();
        for attr in parent.attributes() {
            if merged.find_attribute(&attr.name).is_none() {
                merged.attributes.push(attr.clone());
            }
        }
        for rel in parent.relationships() {
            if merged.find_relationship(&rel.name).is_none() {
                merged.relationships.push(rel.clone());
            }
        }
        merged
    }

    /// Save-time validation. Values are not checked at `set` time, so this is
    /// where a bad write surfaces, as a store error on the commit path.
    pub fn validate_data(&self, data: &ObjectData) -> std::result::Result<(), StoreError> {
        for attr in &self.attributes {
            match data.get(&attr.name) {
                Some(value) => attr.validate(value)?,
                None if !attr.optional => {
                    return Err(StoreError::Validation(format!(
                        "Attribute '{}' of '{}' is required",
                        attr.name, self.name
                    )));
                }
                None => {}
            }
        }
        for (key, value) in data {
            if self.find_attribute(key).is_some() {
                continue;
            }
            match self.find_relationship(key) {
                Some(rel) => match value {
                    Value::Null => {}
                    Value::Reference(id) if id.entity() == rel.destination => {}
                    Value::Reference(id) => {
                        return Err(StoreError::Validation(format!(
                            "Relationship '{}' of '{}' expects '{}', got '{}'",
                            key,
                            self.name,
                            rel.destination,
                            id.entity()
                        )));
                    }
                    other => {
                        return Err(StoreError::Validation(format!(
                            "Relationship '{}' of '{}' expects a reference, got {}",
                            key,
                            self.name,
                            other.type_name()
                        )));
                    }
                },
                None => {
                    return Err(StoreError::Validation(format!(
                        "Entity '{}' has no attribute or relationship '{}'",
                        self.name, key
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stable fingerprint over the full descriptor, used to detect schema
    /// generations when opening a durable store.
    pub fn fingerprint_into(&self, canonical: &mut String) {
        canonical.push_str("entity:");
        canonical.push_str(&self.name);
        if let Some(parent) = &self.parent {
            canonical.push_str(";parent:");
            canonical.push_str(parent);
        }
        let mut attrs: Vec<&Attribute> = self.attributes.iter().collect();
        attrs.sort_by(|a, b| a.name.cmp(&b.name));
        for attr in attrs {
            canonical.push_str(&format!(
                ";attr:{}:{}:{}",
                attr.name, attr.kind, attr.optional
            ));
        }
        let mut rels: Vec<&Relationship> = self.relationships.iter().collect();
        rels.sort_by(|a, b| a.name.cmp(&b.name));
        for rel in rels {
            canonical.push_str(&format!(";rel:{}:{}", rel.name, rel.destination));
        }
        canonical.push('\n');
    }
}

/// Portable 64-bit fingerprint over a set of entity schemas. FNV-1a over the
/// canonical descriptor text, independent of hasher randomization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFingerprint(pub u64);

impl SchemaFingerprint {
    pub fn of(schemas: &[&EntitySchema]) -> Self {
        let mut sorted: Vec<&EntitySchema> = schemas.to_vec();
        sorted.sort_by(|a, b| a.name().cmp(b.name()));
        let mut canonical = String::new();
        for schema in sorted {
            schema.fingerprint_into(&mut canonical);
        }
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Self(hash)
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Schema of an entity with its whole parent chain flattened in. Returns
/// `None` when the entity itself is unknown; a missing ancestor just ends
/// the merge (registration validates ancestors up front).
pub fn effective_schema(
    schemas: &HashMap<String, Arc<EntitySchema>>,
    entity: &str,
) -> Option<EntitySchema> {
    let mut merged = schemas.get(entity)?.as_ref().clone();
    let mut parent_name = merged.parent().map(str::to_string);
    while let Some(name) = parent_name {
        let Some(parent) = schemas.get(&name) else {
            break;
        };
        merged = merged.merged_with_parent(parent);
        parent_name = parent.parent().map(str::to_string);
    }
    Some(merged)
}

/// Walk a (possibly relationship-traversing) key path through the schema
/// graph and return the terminal attribute. Every intermediate segment must
/// name a to-one relationship; the last segment must name an attribute.
pub fn resolve_key_path<'a>(
    schemas: &'a HashMap<String, Arc<EntitySchema>>,
    entity: &str,
    path: &str,
) -> Result<&'a Attribute> {
    let mut current = schemas.get(entity).ok_or_else(|| {
        StackError::Configuration(format!("Entity '{}' is not registered", entity))
    })?;
    let segments: Vec<&str> = path.split('.').collect();
    let (last, intermediate) = segments
        .split_last()
        .ok_or_else(|| StackError::SchemaResolution(path.into(), String::new(), entity.into()))?;

    for segment in intermediate {
        let rel = current.find_relationship(segment).ok_or_else(|| {
            StackError::SchemaResolution(path.into(), (*segment).into(), current.name().into())
        })?;
        current = schemas.get(&rel.destination).ok_or_else(|| {
            StackError::SchemaResolution(path.into(), rel.destination.clone(), current.name().into())
        })?;
    }

    current.find_attribute(last).ok_or_else(|| {
        StackError::SchemaResolution(path.into(), (*last).into(), current.name().into())
    })
}

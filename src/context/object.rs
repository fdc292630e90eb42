use std::fmt;

use crate::context::graph::SharedGraph;
use crate::core::{ObjectData, ObjectId, Result, Value};

/// Lightweight handle to one object in one context's graph. Reads and
/// writes go through the owning graph; cloning the handle does not clone
/// the object. Handles stay valid across saves: once a save assigns a
/// permanent identity, the old temporary identity keeps resolving.
#[derive(Clone)]
pub struct Object {
    graph: SharedGraph,
    id: ObjectId,
}

impl Object {
    pub(crate) fn new(graph: SharedGraph, id: ObjectId) -> Self {
        Self { graph, id }
    }

    /// Canonical identity, permanent once any save has assigned one.
    pub fn id(&self) -> ObjectId {
        self.graph.lock().resolve(&self.id)
    }

    pub fn entity(&self) -> &str {
        self.id.entity()
    }

    /// Attribute read; an unset attribute reads as NULL.
    pub fn get(&self, key: &str) -> Value {
        self.graph
            .lock()
            .value(&self.id, key)
            .unwrap_or(Value::Null)
    }

    /// Record a pending write. Not validated here; an ill-typed value
    /// surfaces as a store validation error when the commit reaches it.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.graph.lock().set_value(&self.id, key, value.into())
    }

    /// Point this object's to-one relationship at another object.
    pub fn set_reference(&self, key: &str, target: &Object) -> Result<()> {
        self.set(key, Value::Reference(target.id()))
    }

    pub fn data(&self) -> Option<ObjectData> {
        self.graph.lock().data(&self.id)
    }

    pub fn is_deleted(&self) -> bool {
        self.graph.lock().is_deleted(&self.id)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object").field("id", &self.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_through_handle() {
        let graph = SharedGraph::new();
        let id = graph.lock().create("Item");
        let object = Object::new(graph, id);

        assert_eq!(object.get("name"), Value::Null);
        object.set("name", "a").unwrap();
        assert_eq!(object.get("name"), Value::from("a"));
        assert_eq!(object.entity(), "Item");
    }

    #[test]
    fn test_handle_survives_id_assignment() {
        let graph = SharedGraph::new();
        let id = graph.lock().create("Item");
        let object = Object::new(graph.clone(), id.clone());

        let permanent = ObjectId::permanent("Item", 5);
        let mut mapping = std::collections::HashMap::new();
        mapping.insert(id, permanent.clone());
        graph.lock().apply_id_mapping(&mapping);

        assert_eq!(object.id(), permanent);
        object.set("name", "a").unwrap();
        assert_eq!(object.get("name"), Value::from("a"));
    }
}

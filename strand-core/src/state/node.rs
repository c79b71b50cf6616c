//! State Node
//!
//! One addressable unit of state within a session: a field store plus the
//! exclusive-access lock dispatch acquires before touching it. The parent
//! link is a plain node id used to resolve cross-node reads and never an
//! owning reference, so parent and child cannot keep each other alive.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::Mutex;

use crate::schema::{NodeId, NodePath, NodeSchema, Schema};
use crate::value::Value;

/// A live node instance: field values plus the execution lock.
#[derive(Debug)]
pub struct StateNode {
    pub path: NodePath,
    /// Weak back-link to the parent, by id.
    pub parent: Option<NodeId>,
    /// Ordered child names, fixed by the schema.
    pub children: Vec<String>,
    /// Field name -> current value, in schema declaration order.
    values: IndexMap<String, Value>,
    /// Exclusive execution lock. Cloned out of the tree so it can be held
    /// across await points without borrowing the tree itself.
    lock: Arc<Mutex<()>>,
}

impl StateNode {
    /// Instantiate a node from its schema, all fields at their defaults.
    pub fn from_schema(schema: &Schema, node: &NodeSchema) -> Self {
        let values = node
            .fields
            .iter()
            .map(|(name, &var)| (name.clone(), schema.var(var).default.clone()))
            .collect();

        Self {
            path: node.path.clone(),
            parent: node.parent,
            children: node.children.keys().cloned().collect(),
            values,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Overwrite a field value. Dirty tracking is the dispatcher's job;
    /// this is a plain store.
    pub fn set(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }

    /// Snapshot view of all fields in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Handle to the node's execution lock.
    pub fn lock_handle(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;
    use crate::value::TypeTag;

    #[test]
    fn node_materializes_defaults_in_order() {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "first", TypeTag::Int, Value::Int(1)).unwrap();
        b.plain(&[], "second", TypeTag::Str, Value::from("two")).unwrap();
        let schema = b.build().unwrap();

        let node = StateNode::from_schema(&schema, schema.node(schema.root()));
        let names: Vec<&String> = node.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(node.get("first"), Some(&Value::Int(1)));
        assert_eq!(node.get("missing"), None);
    }

    #[test]
    fn set_overwrites_in_place() {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "x", TypeTag::Int, Value::Int(0)).unwrap();
        let schema = b.build().unwrap();

        let mut node = StateNode::from_schema(&schema, schema.node(schema.root()));
        node.set("x", Value::Int(7));
        assert_eq!(node.get("x"), Some(&Value::Int(7)));
    }
}

//! Delta Computer
//!
//! After a dispatch pass, the changed-set names every var that was
//! *touched*, written by the handler or recomputed. Clients only care
//! about values that actually differ from what they last saw, so each
//! session keeps a [`BroadcastCache`] of last-broadcast values and
//! [`BroadcastCache::diff`] emits updates only for real differences,
//! under the structural equality policy of [`crate::value::Value`].
//!
//! A recomputation that lands on the same value is suppressed entirely;
//! an idempotent `set` produces no traffic. NaN results re-emit every
//! time, because IEEE comparison never reports them equal. That is the
//! documented policy, not an accident.
//!
//! Updates for one event are ordered by tree pre-order of the owning node
//! (parents before descendants, siblings in declaration order), then by
//! field declaration order, so structural changes arrive before the field
//! updates that refer to them.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::schema::{NodePath, Schema, VarId, VarKind};
use crate::state::StateTree;
use crate::value::Value;

/// One observable field change, as delivered to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub node_path: NodePath,
    pub field: String,
    pub value: Value,
}

/// Last value broadcast to this session's clients, per var.
#[derive(Debug)]
pub struct BroadcastCache {
    values: HashMap<VarId, Value>,
}

impl BroadcastCache {
    /// Seed the cache from a tree's current values. Used at session
    /// creation (defaults) and after a snapshot restore, since clients
    /// receive those values through the initial render, not a delta.
    pub fn from_tree(schema: &Schema, tree: &StateTree) -> Self {
        let values = schema
            .vars()
            .iter()
            .filter(|v| v.kind != VarKind::Constant)
            .map(|v| (v.id, tree.value(schema, v.id).clone()))
            .collect();
        Self { values }
    }

    /// Diff the touched vars against the cache, emitting updates for real
    /// changes only and advancing the cache to the emitted values.
    pub fn diff(
        &mut self,
        schema: &Schema,
        tree: &StateTree,
        changed: &HashSet<VarId>,
    ) -> Vec<FieldUpdate> {
        let mut vars: Vec<VarId> = changed.iter().copied().collect();
        vars.sort_by_key(|&var| {
            let def = schema.var(var);
            (schema.node(def.node).pre_order, def.slot)
        });

        let mut updates = Vec::new();
        for var in vars {
            let def = schema.var(var);
            if def.kind == VarKind::Constant {
                continue;
            }
            let current = tree.value(schema, var);
            let unchanged = self
                .values
                .get(&var)
                .is_some_and(|last| last.structural_eq(current));
            if unchanged {
                continue;
            }
            self.values.insert(var, current.clone());
            updates.push(FieldUpdate {
                node_path: schema.node(def.node).path.clone(),
                field: def.name.clone(),
                value: current.clone(),
            });
        }
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuilder;
    use crate::value::TypeTag;

    fn two_node_schema() -> std::sync::Arc<Schema> {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "title", TypeTag::Str, Value::from("")).unwrap();
        b.plain(&["cart"], "count", TypeTag::Int, Value::Int(0)).unwrap();
        b.plain(&["profile"], "name", TypeTag::Str, Value::from("")).unwrap();
        b.build().unwrap()
    }

    #[test]
    fn unchanged_values_are_suppressed() {
        let schema = two_node_schema();
        let tree = StateTree::new(&schema);
        let mut cache = BroadcastCache::from_tree(&schema, &tree);

        let title = schema.var_id(schema.root(), "title").unwrap();
        // Touched but identical to the cached value.
        let updates = cache.diff(&schema, &tree, &HashSet::from([title]));
        assert!(updates.is_empty());
    }

    #[test]
    fn changed_values_are_emitted_once() {
        let schema = two_node_schema();
        let mut tree = StateTree::new(&schema);
        let mut cache = BroadcastCache::from_tree(&schema, &tree);

        let title = schema.var_id(schema.root(), "title").unwrap();
        tree.set_value(&schema, title, Value::from("hello"));

        let changed = HashSet::from([title]);
        let updates = cache.diff(&schema, &tree, &changed);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].field, "title");
        assert_eq!(updates[0].value, Value::from("hello"));

        // Second diff of the same touched set: already broadcast.
        assert!(cache.diff(&schema, &tree, &changed).is_empty());
    }

    #[test]
    fn updates_are_ordered_by_tree_pre_order() {
        let schema = two_node_schema();
        let mut tree = StateTree::new(&schema);
        let mut cache = BroadcastCache::from_tree(&schema, &tree);

        let title = schema.var_id(schema.root(), "title").unwrap();
        let cart = schema.resolve(&NodePath::from(vec!["cart".to_string()])).unwrap();
        let count = schema.var_id(cart, "count").unwrap();
        let profile = schema
            .resolve(&NodePath::from(vec!["profile".to_string()]))
            .unwrap();
        let name = schema.var_id(profile, "name").unwrap();

        tree.set_value(&schema, name, Value::from("ada"));
        tree.set_value(&schema, count, Value::Int(2));
        tree.set_value(&schema, title, Value::from("shop"));

        let updates = cache.diff(&schema, &tree, &HashSet::from([name, count, title]));
        let fields: Vec<&str> = updates.iter().map(|u| u.field.as_str()).collect();
        // Root first, then cart (declared before profile), then profile.
        assert_eq!(fields, vec!["title", "count", "name"]);
    }

    #[test]
    fn nan_results_are_never_suppressed() {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "ratio", TypeTag::Float, Value::Float(f64::NAN)).unwrap();
        let schema = b.build().unwrap();
        let tree = StateTree::new(&schema);
        let mut cache = BroadcastCache::from_tree(&schema, &tree);

        let ratio = schema.var_id(schema.root(), "ratio").unwrap();
        // The cache holds NaN and the tree holds NaN, but NaN != NaN:
        // the value is re-emitted rather than spuriously suppressed.
        let updates = cache.diff(&schema, &tree, &HashSet::from([ratio]));
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn constants_never_appear_in_deltas() {
        let mut b = SchemaBuilder::new();
        b.constant(&[], "version", Value::Int(1)).unwrap();
        let schema = b.build().unwrap();
        let tree = StateTree::new(&schema);
        let mut cache = BroadcastCache::from_tree(&schema, &tree);

        let version = schema.var_id(schema.root(), "version").unwrap();
        assert!(cache.diff(&schema, &tree, &HashSet::from([version])).is_empty());
    }
}

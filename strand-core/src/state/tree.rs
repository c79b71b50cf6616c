//! State Tree, Evaluation Scope, and Lock Paths
//!
//! A [`StateTree`] is one session's instance of the schema: every node
//! materialized with default values at creation, computed vars evaluated
//! once so the first snapshot is internally consistent.
//!
//! [`EvalScope`] is the only window compute functions get onto the tree.
//! It records every read, which lets the engine verify after each
//! evaluation that the var's declared dependency list covered everything
//! it actually touched. This is the stricter answer to under-declared
//! dependencies, enforced dynamically because compute functions are
//! opaque Rust closures.
//!
//! [`acquire_lock_path`] takes a handler's precomputed root-to-leaf lock
//! chain top-down, each step bounded by the configured timeout, and the
//! returned guard set releases leaf-to-root on drop.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::{BackendError, EventError, HandlerFault};
use crate::schema::{NodeId, NodePath, Schema, VarId, VarKind};
use crate::state::node::StateNode;
use crate::value::Value;

/// One session's live state: a strict tree of nodes, indexed by schema
/// node id.
#[derive(Debug)]
pub struct StateTree {
    nodes: Vec<StateNode>,
}

impl StateTree {
    /// Build a fresh tree from schema defaults and evaluate every
    /// computed var once, in topological order.
    pub fn new(schema: &Schema) -> Self {
        let nodes = schema
            .nodes()
            .map(|node| StateNode::from_schema(schema, node))
            .collect();
        let mut tree = Self { nodes };
        tree.recompute_all(schema);
        tree
    }

    fn recompute_all(&mut self, schema: &Schema) {
        // Dependency-less computed vars have no reverse edges, so seed
        // them explicitly before the topologically ordered remainder.
        let mut order: Vec<VarId> = schema
            .vars()
            .iter()
            .filter(|v| v.kind == VarKind::Computed && v.deps.is_empty())
            .map(|v| v.id)
            .collect();
        let all: std::collections::HashSet<VarId> =
            schema.vars().iter().map(|v| v.id).collect();
        order.extend(schema.graph().affected_by(&all));
        for (var, fault) in recompute(schema, self, &order) {
            warn!(var = %schema.var(var).name, %fault, "initial evaluation failed");
        }
    }

    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut StateNode {
        &mut self.nodes[id.index()]
    }

    /// Current value of a var.
    pub fn value(&self, schema: &Schema, var: VarId) -> &Value {
        let def = schema.var(var);
        self.node(def.node)
            .get(&def.name)
            .expect("tree materializes every schema field")
    }

    /// Overwrite a var's value. Callers track dirtiness; this is storage.
    pub fn set_value(&mut self, schema: &Schema, var: VarId, value: Value) {
        let def = schema.var(var);
        self.node_mut(def.node).set(&def.name, value);
    }

    /// Serializable snapshot of every node's fields, for the persistence
    /// backend.
    pub fn snapshot(&self) -> TreeSnapshot {
        TreeSnapshot {
            nodes: self
                .nodes
                .iter()
                .map(|node| NodeSnapshot {
                    path: node.path.clone(),
                    values: node
                        .fields()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                })
                .collect(),
        }
    }

    /// Rebuild a tree from a snapshot: plain vars are overlaid from the
    /// snapshot, constants come from the schema, computed vars are
    /// re-evaluated. Fields the current schema no longer declares are
    /// dropped with a warning, so old snapshots survive schema evolution.
    pub fn restore(schema: &Schema, snapshot: &TreeSnapshot) -> Result<Self, BackendError> {
        let mut tree = Self {
            nodes: schema
                .nodes()
                .map(|node| StateNode::from_schema(schema, node))
                .collect(),
        };

        for node_snap in &snapshot.nodes {
            let Some(node_id) = schema.resolve(&node_snap.path) else {
                warn!(path = %node_snap.path, "snapshot node not in schema, dropping");
                continue;
            };
            for (field, value) in &node_snap.values {
                match schema.var_id(node_id, field) {
                    Some(var) if schema.var(var).kind == VarKind::Plain => {
                        // Same admission check a handler write gets; a
                        // field whose declared type drifted since the
                        // snapshot keeps its schema default.
                        if schema.var(var).ty.admits(value) {
                            tree.node_mut(node_id).set(field, value.clone());
                        } else {
                            warn!(
                                path = %node_snap.path,
                                field,
                                "snapshot value no longer satisfies declared type, dropping"
                            );
                        }
                    }
                    Some(_) => {} // constants and computed vars come from the schema
                    None => {
                        warn!(path = %node_snap.path, field, "snapshot field not in schema, dropping");
                    }
                }
            }
        }

        tree.recompute_all(schema);
        Ok(tree)
    }
}

/// Serializable image of a [`StateTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub path: NodePath,
    pub values: IndexMap<String, Value>,
}

/// Read-only, read-recording view of a tree for compute functions.
pub struct EvalScope<'a> {
    schema: &'a Schema,
    tree: &'a StateTree,
    reads: RefCell<SmallVec<[VarId; 8]>>,
}

impl<'a> EvalScope<'a> {
    pub fn new(schema: &'a Schema, tree: &'a StateTree) -> Self {
        Self {
            schema,
            tree,
            reads: RefCell::new(SmallVec::new()),
        }
    }

    /// Read a var's current value, recording the read.
    pub fn get(&self, var: VarId) -> Value {
        self.reads.borrow_mut().push(var);
        self.tree.value(self.schema, var).clone()
    }

    /// Read by node path and field name. Faults on unknown references so
    /// a typo in a compute function surfaces as a handler fault instead
    /// of a silent default.
    pub fn get_by_name(&self, path: &NodePath, field: &str) -> Result<Value, HandlerFault> {
        let node = self
            .schema
            .resolve(path)
            .ok_or_else(|| HandlerFault::new(format!("unknown node path `{path}`")))?;
        let var = self
            .schema
            .var_id(node, field)
            .ok_or_else(|| HandlerFault::new(format!("unknown field `{field}` on `{path}`")))?;
        Ok(self.get(var))
    }

    fn into_reads(self) -> SmallVec<[VarId; 8]> {
        self.reads.into_inner()
    }
}

/// Evaluate the given computed vars in order, writing each result into the
/// tree. Returns the faults encountered; a faulted var keeps its previous
/// value. An evaluation that reads a var missing from its declared
/// dependency list is reported as a fault (the stale-value bug class this
/// check exists to catch) but its result is still stored.
pub(crate) fn recompute(
    schema: &Schema,
    tree: &mut StateTree,
    order: &[VarId],
) -> Vec<(VarId, HandlerFault)> {
    let mut faults = Vec::new();

    for &var in order {
        let def = schema.var(var);
        let Some(compute) = def.compute.as_ref() else {
            continue;
        };

        let scope = EvalScope::new(schema, tree);
        let result = compute(&scope);
        let reads = scope.into_reads();

        for read in &reads {
            if !def.deps.contains(read) {
                let read_def = schema.var(*read);
                faults.push((
                    var,
                    HandlerFault::new(format!(
                        "computed var `{}` read undeclared dependency `{}`",
                        def.name, read_def.name
                    )),
                ));
            }
        }

        match result {
            Ok(value) => tree.set_value(schema, var, value),
            Err(fault) => faults.push((var, fault)),
        }
    }

    faults
}

/// Guards for an acquired lock path. Dropping releases leaf-to-root,
/// the reverse of acquisition order.
pub struct PathGuards {
    guards: Vec<OwnedMutexGuard<()>>,
}

impl Drop for PathGuards {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

/// Acquire a root-to-leaf chain of node locks top-down, bounding each
/// acquisition by `timeout`. On timeout the guards already held are
/// released (in reverse) and the event fails with `LockTimeout` instead
/// of blocking forever.
pub async fn acquire_lock_path(
    handles: Vec<Arc<Mutex<()>>>,
    timeout: Duration,
) -> Result<PathGuards, EventError> {
    let mut guards = Vec::with_capacity(handles.len());
    for handle in handles {
        match tokio::time::timeout(timeout, handle.lock_owned()).await {
            Ok(guard) => guards.push(guard),
            Err(_) => {
                drop(PathGuards { guards });
                return Err(EventError::LockTimeout(timeout));
            }
        }
    }
    Ok(PathGuards { guards })
}

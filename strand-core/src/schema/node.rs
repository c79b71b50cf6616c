//! Node Schemas and the Schema Builder
//!
//! A [`NodeSchema`] describes one addressable node in the state tree: its
//! fields, its handlers, and its child nodes. The [`SchemaBuilder`] is the
//! only way to construct a [`Schema`]; `build()` resolves every by-name
//! reference, rejects cycles and type errors, precomputes handler lock
//! paths and pre-order ranks, and then freezes the result behind an `Arc`.
//!
//! # Lock Paths
//!
//! A handler may mutate fields whose computed dependents live on other
//! nodes, so executing it must exclude concurrent access to every node it
//! can reach. `build()` derives the reachable set statically from the
//! declared cross-node dependency edges and stores, per handler, the
//! ancestor closure of that set in tree pre-order. Acquiring locks in that
//! fixed order (root first) keeps the ordering consistent across all
//! handlers, which is what rules out deadlock; release happens in reverse.
//! Every path starts at the root, so events on one session serialize while
//! events on different sessions never contend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{HandlerFault, SchemaError};
use crate::runtime::HandlerCtx;
use crate::schema::graph::DepGraph;
use crate::schema::var::{ComputeFn, VarDef, VarId, VarKind, VarRef};
use crate::state::EvalScope;
use crate::value::{TypeTag, Value};

/// Address of a node: the sequence of child names from the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePath(Vec<String>);

impl NodePath {
    /// The empty path, addressing the root node.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn child(&self, name: &str) -> NodePath {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        NodePath(segments)
    }

    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        Some(NodePath(self.0[..self.0.len() - 1].to_vec()))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "(root)")
        } else {
            write!(f, "{}", self.0.join("."))
        }
    }
}

impl From<Vec<String>> for NodePath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl From<&[&str]> for NodePath {
    fn from(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }
}

/// Identifier of a node schema within its [`Schema`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Handler function: takes the dispatch context, mutates plain vars,
/// optionally enqueues chained events.
pub type HandlerFn = Arc<dyn Fn(&mut HandlerCtx<'_>) -> Result<(), HandlerFault> + Send + Sync>;

/// A named event handler registered on a node schema.
pub struct HandlerDef {
    pub name: String,
    /// Declared argument types, checked before execution.
    pub params: Vec<TypeTag>,
    pub func: HandlerFn,
    /// Nodes to lock before executing, in tree pre-order (root first).
    pub lock_path: SmallVec<[NodeId; 4]>,
}

impl fmt::Debug for HandlerDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDef")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Schema of one node in the state tree.
#[derive(Debug)]
pub struct NodeSchema {
    pub id: NodeId,
    pub path: NodePath,
    pub parent: Option<NodeId>,
    /// Rank in a depth-first pre-order walk of the tree; used to order
    /// delta output.
    pub pre_order: u32,
    /// Field name -> var, in declaration order.
    pub fields: IndexMap<String, VarId>,
    pub handlers: IndexMap<String, HandlerDef>,
    /// Child name -> node, in declaration order.
    pub children: IndexMap<String, NodeId>,
}

/// An immutable, fully resolved application schema.
///
/// Shared as `Arc<Schema>` across every session; safe for unsynchronized
/// concurrent reads because nothing in it mutates after `build()`.
#[derive(Debug)]
pub struct Schema {
    nodes: Vec<NodeSchema>,
    vars: Vec<VarDef>,
    graph: DepGraph,
    by_path: HashMap<NodePath, NodeId>,
}

impl Schema {
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &NodeSchema {
        &self.nodes[id.index()]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSchema> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Look up a node by path.
    pub fn resolve(&self, path: &NodePath) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn var(&self, id: VarId) -> &VarDef {
        &self.vars[id.index()]
    }

    pub fn vars(&self) -> &[VarDef] {
        &self.vars
    }

    pub fn var_id(&self, node: NodeId, field: &str) -> Option<VarId> {
        self.node(node).fields.get(field).copied()
    }

    pub fn handler(&self, node: NodeId, name: &str) -> Option<&HandlerDef> {
        self.node(node).handlers.get(name)
    }

    pub fn graph(&self) -> &DepGraph {
        &self.graph
    }
}

struct FieldDecl {
    ty: TypeTag,
    kind: VarKind,
    default: Value,
    deps: Vec<VarRef>,
    compute: Option<ComputeFn>,
}

struct HandlerDecl {
    params: Vec<TypeTag>,
    func: HandlerFn,
}

struct NodeDecl {
    path: NodePath,
    parent: Option<usize>,
    fields: IndexMap<String, FieldDecl>,
    handlers: IndexMap<String, HandlerDecl>,
    children: IndexMap<String, usize>,
}

/// Builder for [`Schema`]. All registration happens here; `build()`
/// validates and freezes the result.
pub struct SchemaBuilder {
    nodes: Vec<NodeDecl>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![NodeDecl {
                path: NodePath::root(),
                parent: None,
                fields: IndexMap::new(),
                handlers: IndexMap::new(),
                children: IndexMap::new(),
            }],
        }
    }

    /// Declare a substate node (and any missing ancestors) at `path`.
    /// Declaring an existing node is a no-op; field declarations create
    /// their node implicitly.
    pub fn substate(&mut self, path: &[&str]) -> &mut Self {
        self.ensure_node(path);
        self
    }

    fn ensure_node(&mut self, path: &[&str]) -> usize {
        let mut current = 0usize;
        for segment in path {
            if let Some(&child) = self.nodes[current].children.get(*segment) {
                current = child;
                continue;
            }
            let child_path = self.nodes[current].path.child(segment);
            let child = self.nodes.len();
            self.nodes.push(NodeDecl {
                path: child_path,
                parent: Some(current),
                fields: IndexMap::new(),
                handlers: IndexMap::new(),
                children: IndexMap::new(),
            });
            self.nodes[current]
                .children
                .insert(segment.to_string(), child);
            current = child;
        }
        current
    }

    fn add_field(
        &mut self,
        path: &[&str],
        name: &str,
        decl: FieldDecl,
    ) -> Result<&mut Self, SchemaError> {
        let node = self.ensure_node(path);
        if self.nodes[node].fields.contains_key(name) {
            return Err(SchemaError::DuplicateField {
                node: self.nodes[node].path.to_string(),
                field: name.to_string(),
            });
        }
        self.nodes[node].fields.insert(name.to_string(), decl);
        Ok(self)
    }

    /// Declare a plain (directly settable) var.
    pub fn plain(
        &mut self,
        path: &[&str],
        name: &str,
        ty: TypeTag,
        default: Value,
    ) -> Result<&mut Self, SchemaError> {
        self.add_field(
            path,
            name,
            FieldDecl {
                ty,
                kind: VarKind::Plain,
                default,
                deps: Vec::new(),
                compute: None,
            },
        )
    }

    /// Declare a constant var. Constants are visible to computed vars and
    /// the registry but can never be assigned.
    pub fn constant(
        &mut self,
        path: &[&str],
        name: &str,
        value: Value,
    ) -> Result<&mut Self, SchemaError> {
        let ty = value.type_tag();
        self.add_field(
            path,
            name,
            FieldDecl {
                ty,
                kind: VarKind::Constant,
                default: value,
                deps: Vec::new(),
                compute: None,
            },
        )
    }

    /// Declare a computed var with its explicit dependency list.
    ///
    /// The declared dependencies must cover every var the function reads;
    /// the engine verifies this on each recomputation and reports an
    /// under-declared read as a handler fault.
    pub fn computed<F>(
        &mut self,
        path: &[&str],
        name: &str,
        ty: TypeTag,
        deps: Vec<VarRef>,
        compute: F,
    ) -> Result<&mut Self, SchemaError>
    where
        F: Fn(&EvalScope<'_>) -> Result<Value, HandlerFault> + Send + Sync + 'static,
    {
        self.add_field(
            path,
            name,
            FieldDecl {
                ty,
                kind: VarKind::Computed,
                default: Value::Null,
                deps,
                compute: Some(Arc::new(compute)),
            },
        )
    }

    /// Register an event handler on a node.
    pub fn handler<F>(
        &mut self,
        path: &[&str],
        name: &str,
        params: &[TypeTag],
        func: F,
    ) -> Result<&mut Self, SchemaError>
    where
        F: Fn(&mut HandlerCtx<'_>) -> Result<(), HandlerFault> + Send + Sync + 'static,
    {
        let node = self.ensure_node(path);
        if self.nodes[node].handlers.contains_key(name) {
            return Err(SchemaError::DuplicateHandler {
                node: self.nodes[node].path.to_string(),
                handler: name.to_string(),
            });
        }
        self.nodes[node].handlers.insert(
            name.to_string(),
            HandlerDecl {
                params: params.to_vec(),
                func: Arc::new(func),
            },
        );
        Ok(self)
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> Result<Arc<Schema>, SchemaError> {
        let decls = self.nodes;
        let parents: Vec<Option<usize>> = decls.iter().map(|d| d.parent).collect();

        // Pre-order ranks via DFS over declared children.
        let mut pre_order = vec![0u32; decls.len()];
        let mut rank = 0u32;
        let mut stack = vec![0usize];
        while let Some(node) = stack.pop() {
            pre_order[node] = rank;
            rank += 1;
            // Reverse so the first declared child is visited first.
            for &child in decls[node].children.values().rev() {
                stack.push(child);
            }
        }

        // Assign var ids in (node, slot) order and index them by name.
        let mut by_ref: HashMap<(usize, String), VarId> = HashMap::new();
        let mut var_count = 0u32;
        for (node, decl) in decls.iter().enumerate() {
            for field in decl.fields.keys() {
                by_ref.insert((node, field.clone()), VarId(var_count));
                var_count += 1;
            }
        }

        let by_path: HashMap<NodePath, NodeId> = decls
            .iter()
            .enumerate()
            .map(|(i, d)| (d.path.clone(), NodeId(i as u32)))
            .collect();

        // Resolve dependency refs and materialize var defs.
        let mut vars: Vec<VarDef> = Vec::with_capacity(var_count as usize);
        let mut graph = DepGraph::with_capacity(var_count as usize);
        for (node, decl) in decls.iter().enumerate() {
            for (slot, (name, field)) in decl.fields.iter().enumerate() {
                let id = by_ref[&(node, name.clone())];
                let display = VarRef::new(decl.path.clone(), name.clone()).to_string();

                if field.kind != VarKind::Computed && !field.ty.admits(&field.default) {
                    return Err(SchemaError::InvalidVar {
                        var: display,
                        reason: format!(
                            "default {:?} does not satisfy type {:?}",
                            field.default, field.ty
                        ),
                    });
                }

                let mut deps: SmallVec<[VarId; 4]> = SmallVec::new();
                for dep in &field.deps {
                    let dep_node =
                        by_path.get(&dep.path).map(|id| id.index()).ok_or_else(|| {
                            SchemaError::UnknownDependency {
                                var: display.clone(),
                                dep: dep.to_string(),
                            }
                        })?;
                    let dep_id = by_ref.get(&(dep_node, dep.field.clone())).ok_or_else(|| {
                        SchemaError::UnknownDependency {
                            var: display.clone(),
                            dep: dep.to_string(),
                        }
                    })?;
                    deps.push(*dep_id);
                }

                if field.kind == VarKind::Computed {
                    graph.register(id, &deps, &display)?;
                }

                vars.push(VarDef {
                    id,
                    node: NodeId(node as u32),
                    slot: slot as u32,
                    name: name.clone(),
                    ty: field.ty,
                    kind: field.kind,
                    default: field.default.clone(),
                    deps,
                    compute: field.compute.clone(),
                });
            }
        }

        let mut nodes: Vec<NodeSchema> = Vec::with_capacity(decls.len());
        for (node, decl) in decls.into_iter().enumerate() {
            let lock_path = lock_path_for(node, &decl.fields, &by_ref, &graph, &vars, &parents,
                &pre_order);

            let mut handlers = IndexMap::new();
            for (name, h) in decl.handlers {
                handlers.insert(
                    name.clone(),
                    HandlerDef {
                        name,
                        params: h.params,
                        func: h.func,
                        lock_path: lock_path.clone(),
                    },
                );
            }

            nodes.push(NodeSchema {
                id: NodeId(node as u32),
                path: decl.path,
                parent: parents[node].map(|p| NodeId(p as u32)),
                pre_order: pre_order[node],
                fields: decl
                    .fields
                    .keys()
                    .map(|name| (name.clone(), by_ref[&(node, name.clone())]))
                    .collect(),
                handlers,
                children: decl
                    .children
                    .into_iter()
                    .map(|(name, id)| (name, NodeId(id as u32)))
                    .collect(),
            });
        }

        Ok(Arc::new(Schema {
            nodes,
            vars,
            graph,
            by_path,
        }))
    }
}

impl Default for SchemaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reachable-node closure for handlers on `node`: the node itself, the
/// owners of every computed var downstream of its fields, the owners of
/// those vars' upstream dependencies, and all ancestors of the above,
/// ordered by tree pre-order so acquisition is always root-first.
fn lock_path_for(
    node: usize,
    fields: &IndexMap<String, FieldDecl>,
    by_ref: &HashMap<(usize, String), VarId>,
    graph: &DepGraph,
    vars: &[VarDef],
    parents: &[Option<usize>],
    pre_order: &[u32],
) -> SmallVec<[NodeId; 4]> {
    let mut reach: HashSet<usize> = HashSet::from([0, node]);

    let mut queue: VecDeque<VarId> = fields
        .keys()
        .map(|name| by_ref[&(node, name.clone())])
        .collect();
    let mut seen: HashSet<VarId> = queue.iter().copied().collect();
    while let Some(var) = queue.pop_front() {
        for &downstream in graph.dependents_of(var) {
            reach.insert(vars[downstream.index()].node.index());
            for &upstream in graph.deps_of(downstream) {
                reach.insert(vars[upstream.index()].node.index());
            }
            if seen.insert(downstream) {
                queue.push_back(downstream);
            }
        }
    }

    // Ancestor closure: the path must run contiguously from the root.
    for target in reach.iter().copied().collect::<Vec<_>>() {
        let mut current = target;
        while let Some(parent) = parents[current] {
            reach.insert(parent);
            current = parent;
        }
    }

    let mut path: SmallVec<[NodeId; 4]> = reach.into_iter().map(|n| NodeId(n as u32)).collect();
    path.sort_by_key(|id| pre_order[id.index()]);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_schema() -> Arc<Schema> {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "count", TypeTag::Int, Value::Int(0)).unwrap();
        b.computed(
            &[],
            "doubled",
            TypeTag::Int,
            vec![VarRef::root("count")],
            |scope| {
                let count = scope.get_by_name(&NodePath::root(), "count")?;
                Ok(Value::Int(count.as_int().unwrap_or(0) * 2))
            },
        )
        .unwrap();
        b.build().unwrap()
    }

    #[test]
    fn builds_and_resolves_paths() {
        let schema = counter_schema();
        assert_eq!(schema.node_count(), 1);
        assert_eq!(schema.resolve(&NodePath::root()), Some(schema.root()));
        assert!(schema
            .resolve(&NodePath::from(vec!["nope".to_string()]))
            .is_none());
        assert!(schema.var_id(schema.root(), "count").is_some());
    }

    #[test]
    fn field_declaration_creates_missing_ancestors() {
        // Node paths are never rejected at build time; declaring a field
        // on an undeclared path creates the node and its ancestors.
        let mut b = SchemaBuilder::new();
        b.plain(&["cart", "totals"], "sum", TypeTag::Int, Value::Int(0))
            .unwrap();
        let schema = b.build().unwrap();

        assert_eq!(schema.node_count(), 3);
        let totals = schema
            .resolve(&NodePath::from(&["cart", "totals"][..]))
            .unwrap();
        assert!(schema.var_id(totals, "sum").is_some());
        assert!(schema.resolve(&NodePath::from(&["cart"][..])).is_some());
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "x", TypeTag::Int, Value::Int(0)).unwrap();
        let err = b.plain(&[], "x", TypeTag::Int, Value::Int(0));
        assert!(matches!(err, Err(SchemaError::DuplicateField { .. })));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut b = SchemaBuilder::new();
        b.computed(
            &[],
            "ghost",
            TypeTag::Int,
            vec![VarRef::root("missing")],
            |_| Ok(Value::Int(0)),
        )
        .unwrap();
        assert!(matches!(
            b.build(),
            Err(SchemaError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn three_var_cycle_is_rejected_at_build() {
        let mut b = SchemaBuilder::new();
        b.computed(&[], "a", TypeTag::Int, vec![VarRef::root("b")], |_| {
            Ok(Value::Int(0))
        })
        .unwrap();
        b.computed(&[], "b", TypeTag::Int, vec![VarRef::root("c")], |_| {
            Ok(Value::Int(0))
        })
        .unwrap();
        b.computed(&[], "c", TypeTag::Int, vec![VarRef::root("a")], |_| {
            Ok(Value::Int(0))
        })
        .unwrap();
        assert!(matches!(
            b.build(),
            Err(SchemaError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn default_must_satisfy_declared_type() {
        let mut b = SchemaBuilder::new();
        b.plain(&[], "flag", TypeTag::Bool, Value::Int(1)).unwrap();
        assert!(matches!(b.build(), Err(SchemaError::InvalidVar { .. })));
    }

    #[test]
    fn pre_order_follows_declaration_order_of_children() {
        let mut b = SchemaBuilder::new();
        b.substate(&["cart"]);
        b.substate(&["cart", "totals"]);
        b.substate(&["profile"]);
        let schema = b.build().unwrap();

        let rank = |path: &[&str]| {
            let id = schema.resolve(&NodePath::from(path)).unwrap();
            schema.node(id).pre_order
        };
        assert_eq!(rank(&[]), 0);
        assert!(rank(&["cart"]) < rank(&["cart", "totals"]));
        assert!(rank(&["cart", "totals"]) < rank(&["profile"]));
    }

    #[test]
    fn lock_path_spans_cross_node_dependencies() {
        let mut b = SchemaBuilder::new();
        b.plain(&["cart"], "subtotal", TypeTag::Float, Value::Float(0.0))
            .unwrap();
        b.computed(
            &["summary"],
            "grand_total",
            TypeTag::Float,
            vec![VarRef::new(NodePath::from(vec!["cart".to_string()]), "subtotal")],
            |_| Ok(Value::Float(0.0)),
        )
        .unwrap();
        b.handler(&["cart"], "add_item", &[], |_| Ok(())).unwrap();
        let schema = b.build().unwrap();

        let cart = schema.resolve(&NodePath::from(vec!["cart".to_string()])).unwrap();
        let summary = schema
            .resolve(&NodePath::from(vec!["summary".to_string()]))
            .unwrap();
        let handler = schema.handler(cart, "add_item").unwrap();

        // Root first, then the two sibling nodes, in pre-order.
        assert_eq!(handler.lock_path[0], schema.root());
        assert!(handler.lock_path.contains(&cart));
        assert!(handler.lock_path.contains(&summary));
    }
}

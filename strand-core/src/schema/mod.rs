//! Schema: Vars, Handlers, and the Dependency Graph
//!
//! A schema describes the shape of one application's state tree: which
//! nodes exist, which fields (vars) live on each node, which handlers may
//! be invoked, and how computed vars derive from plain ones.
//!
//! The schema is built exactly once at process start through
//! [`SchemaBuilder`] and is immutable afterwards. Every session shares the
//! same `Arc<Schema>`; because nothing in it ever mutates, it is read
//! concurrently from all sessions without any locking. There are no global
//! registries; anything that needs the schema is handed the `Arc`.
//!
//! # Cycle Safety
//!
//! Computed vars may depend on other computed vars, including across
//! nodes. The dependency graph rejects, at build time, any edge set that
//! would let a var reach itself; a process never starts with a cyclic
//! schema.

mod graph;
mod node;
mod registry;
mod var;

pub use graph::DepGraph;
pub use node::{HandlerDef, HandlerFn, NodeId, NodePath, NodeSchema, Schema, SchemaBuilder};
pub use registry::{HandlerInfo, NodeRegistry, SchemaRegistry, VarInfo};
pub use var::{ComputeFn, VarDef, VarId, VarKind, VarRef};

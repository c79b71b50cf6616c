//! Var Definitions
//!
//! A var is a typed, named reference to a value on a state node. Plain
//! vars are set directly by handlers; computed vars derive from other vars
//! through a pure function; constants never change after tree creation.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::HandlerFault;
use crate::schema::node::{NodeId, NodePath};
use crate::state::EvalScope;
use crate::value::{TypeTag, Value};

/// Dense index into a schema's var table.
///
/// Assigned by the builder in declaration order; valid only against the
/// schema that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub(crate) u32);

impl VarId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// What kind of var a field is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    /// Directly settable by handlers. The roots of the dependency graph.
    Plain,

    /// Derived from other vars; recomputed when an upstream var changes.
    Computed,

    /// A literal fixed at schema build time. Never written, never diffed.
    Constant,
}

/// Build-time reference to a var by node path and field name.
///
/// Resolved to a [`VarId`] when the schema is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub path: NodePath,
    pub field: String,
}

impl VarRef {
    pub fn new(path: impl Into<NodePath>, field: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            field: field.into(),
        }
    }

    /// Reference to a field on the root node.
    pub fn root(field: impl Into<String>) -> Self {
        Self {
            path: NodePath::root(),
            field: field.into(),
        }
    }
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_root() {
            write!(f, "{}", self.field)
        } else {
            write!(f, "{}.{}", self.path, self.field)
        }
    }
}

/// Pure derivation function for a computed var.
///
/// Reads go through the [`EvalScope`], which records them so the engine
/// can verify the declared dependency list covers everything actually
/// read.
pub type ComputeFn = Arc<dyn Fn(&EvalScope<'_>) -> Result<Value, HandlerFault> + Send + Sync>;

/// A fully resolved var in a built schema.
pub struct VarDef {
    pub id: VarId,
    /// Node this var lives on.
    pub node: NodeId,
    /// Position within the owning node's field table.
    pub slot: u32,
    pub name: String,
    pub ty: TypeTag,
    pub kind: VarKind,
    /// Initial value for new trees; the fixed value for constants.
    pub default: Value,
    /// Declared upstream vars. Empty for plain vars and constants.
    pub deps: SmallVec<[VarId; 4]>,
    /// Present iff `kind == Computed`.
    pub compute: Option<ComputeFn>,
}

impl fmt::Debug for VarDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VarDef")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("kind", &self.kind)
            .field("deps", &self.deps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_ref_display() {
        assert_eq!(VarRef::root("count").to_string(), "count");
        assert_eq!(
            VarRef::new(vec!["cart".to_string()], "total").to_string(),
            "cart.total"
        );
    }
}

//! Read-Only Schema Registry
//!
//! The component/compiler layer needs to know, per node, which vars exist
//! (name, type, kind) and which handlers may be bound to event triggers
//! (name, argument signature). [`Schema::registry`] exports exactly that
//! as a plain serializable description; it carries no functions and no
//! live state.

use serde::Serialize;

use crate::schema::node::{NodePath, Schema};
use crate::schema::var::VarKind;
use crate::value::TypeTag;

/// Description of one var, as exposed to the component layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VarInfo {
    pub name: String,
    pub ty: TypeTag,
    pub kind: VarKind,
}

/// Description of one handler, as exposed to the component layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    pub name: String,
    pub params: Vec<TypeTag>,
}

/// Description of one node schema.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRegistry {
    pub path: NodePath,
    pub vars: Vec<VarInfo>,
    pub handlers: Vec<HandlerInfo>,
}

/// The full exported schema description, nodes in tree pre-order.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaRegistry {
    pub nodes: Vec<NodeRegistry>,
}

impl Schema {
    /// Export the read-only registry consumed by the component/compiler
    /// layer.
    pub fn registry(&self) -> SchemaRegistry {
        let mut nodes: Vec<&crate::schema::node::NodeSchema> = self.nodes().collect();
        nodes.sort_by_key(|n| n.pre_order);

        SchemaRegistry {
            nodes: nodes
                .into_iter()
                .map(|node| NodeRegistry {
                    path: node.path.clone(),
                    vars: node
                        .fields
                        .values()
                        .map(|&id| {
                            let var = self.var(id);
                            VarInfo {
                                name: var.name.clone(),
                                ty: var.ty,
                                kind: var.kind,
                            }
                        })
                        .collect(),
                    handlers: node
                        .handlers
                        .values()
                        .map(|h| HandlerInfo {
                            name: h.name.clone(),
                            params: h.params.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

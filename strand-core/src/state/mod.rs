//! Live Session State
//!
//! This module holds the mutable half of the engine: the per-session
//! [`StateTree`] of [`StateNode`]s, the node locks dispatch acquires, and
//! the [`EvalScope`] computed vars read through.
//!
//! The schema says what *can* exist; a tree is one session's instance of
//! it. There is exactly one live node per (session, path), the tree is a
//! strict hierarchy (parent links are ids, never owning references), and a
//! node is only mutated while its lock path is held.

mod node;
mod tree;

pub use node::StateNode;
pub use tree::{acquire_lock_path, EvalScope, NodeSnapshot, PathGuards, StateTree, TreeSnapshot};

pub(crate) use tree::recompute;

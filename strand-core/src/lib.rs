//! Strand Core
//!
//! This crate provides the reactive state engine for the Strand UI
//! framework. It implements:
//!
//! - Schema definition: typed vars, computed vars, handlers, and the
//!   dependency graph (cycle-checked at build time)
//! - Per-session state trees with per-node execution locks
//! - Event dispatch: lock, execute, recompute, diff, broadcast
//! - Session lifecycle: lazy creation, idle and capacity eviction,
//!   snapshot persistence through pluggable backends
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `schema`: Immutable shape of the application's state tree
//! - `state`: Live per-session trees and the lock discipline
//! - `delta`: Broadcast cache and change suppression
//! - `runtime`: Event dispatcher and session manager
//! - `protocol`: JSON message shapes exchanged with clients
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use strand_core::config::EngineConfig;
//! use strand_core::runtime::{EphemeralBackend, SessionManager};
//! use strand_core::schema::{NodePath, SchemaBuilder, VarRef};
//! use strand_core::value::{TypeTag, Value};
//!
//! let mut builder = SchemaBuilder::new();
//! builder.plain(&[], "count", TypeTag::Int, Value::Int(0))?;
//! builder.computed(&[], "doubled", TypeTag::Int, vec![VarRef::root("count")], |scope| {
//!     let count = scope.get_by_name(&NodePath::root(), "count")?;
//!     Ok(Value::Int(count.as_int().unwrap_or(0) * 2))
//! })?;
//! builder.handler(&[], "increment", &[], |ctx| {
//!     let count = ctx.get("count")?.as_int().unwrap_or(0);
//!     ctx.set("count", Value::Int(count + 1))
//! })?;
//! let schema = builder.build()?;
//!
//! let manager = SessionManager::new(schema, EngineConfig::default(), Arc::new(EphemeralBackend));
//! let outcome = manager
//!     .dispatch("session-1", &NodePath::root(), "increment", vec![])
//!     .await?;
//! assert_eq!(outcome.seq, Some(1));
//! ```

pub mod config;
pub mod delta;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod schema;
pub mod state;
pub mod value;

pub use config::EngineConfig;
pub use error::{BackendError, EventError, HandlerFault, SchemaError};
pub use runtime::{DispatchOutcome, SessionManager};
pub use schema::{NodePath, Schema, SchemaBuilder, VarRef};
pub use value::{TypeTag, Value};

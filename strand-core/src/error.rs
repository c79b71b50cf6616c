//! Error Taxonomy
//!
//! Errors fall into three tiers with different blast radii:
//!
//! - [`SchemaError`]: raised while building a schema. These are fatal: a
//!   process must not start serving sessions with an invalid schema.
//! - [`EventError`]: raised while dispatching a single event. Recoverable;
//!   reported back to the originating client and never allowed to affect
//!   other sessions.
//! - [`HandlerFault`]: an application-level failure raised by handler or
//!   compute code. Captured by the dispatcher; mutations applied before the
//!   fault are kept and a partial delta is still delivered alongside it.

use std::time::Duration;

use thiserror::Error;

/// Schema construction failures. Build-time, process-fatal.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Registering the var would close a dependency cycle.
    #[error("cyclic dependency: `{var}` participates in a dependency cycle")]
    CyclicDependency { var: String },

    #[error("duplicate field `{field}` on node `{node}`")]
    DuplicateField { node: String, field: String },

    #[error("duplicate handler `{handler}` on node `{node}`")]
    DuplicateHandler { node: String, handler: String },

    /// A computed var declared a dependency that does not exist.
    #[error("computed var `{var}` declares unknown dependency `{dep}`")]
    UnknownDependency { var: String, dep: String },

    /// A computed var was declared without a compute function, or a
    /// default value does not satisfy its declared type.
    #[error("invalid var `{var}`: {reason}")]
    InvalidVar { var: String, reason: String },
}

/// Per-event failures. Recoverable; local to one session.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown node path `{path}`")]
    UnknownNode { path: String },

    #[error("no handler `{handler}` registered on node `{path}`")]
    UnknownHandler { path: String, handler: String },

    #[error("session `{0}` not found")]
    SessionNotFound(String),

    #[error("handler `{handler}`: {reason}")]
    BadArguments { handler: String, reason: String },

    #[error("timed out after {0:?} waiting for state lock")]
    LockTimeout(Duration),

    /// A handler chain exceeded the configured pass budget. Deltas for the
    /// passes that did run have already been queued for delivery.
    #[error("chained event budget ({0}) exhausted")]
    ChainOverflow(usize),
}

/// An application fault raised by handler or compute code.
///
/// Faults do not abort the dispatch pass: whatever state was mutated before
/// the fault stays mutated, recomputation and diffing still run, and the
/// fault is reported alongside the (possibly partial) delta.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerFault {
    pub message: String,
}

impl HandlerFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Persistence backend failures at session boundaries.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to encode session snapshot: {0}")]
    Encode(String),

    #[error("failed to decode session snapshot: {0}")]
    Decode(String),

    #[error("backend storage error: {0}")]
    Storage(String),
}

//! Runtime: Event Dispatch and Session Management
//!
//! The dispatcher runs one event through a linear state machine
//! (`Idle → Locked → Executing → Recomputing → Diffing → Idle`); the
//! session manager owns one state tree per session id, serializes events
//! within a session through the root lock, runs sessions in parallel, and
//! fans deltas out to connected clients in dispatch order.

mod backend;
mod dispatcher;
mod session;

pub use backend::{EphemeralBackend, InMemoryBackend, StateBackend};
pub use dispatcher::{ChainedEvent, DispatchOutcome, DispatchPhase, HandlerCtx};
pub use session::{ClientId, Session, SessionManager};

//! Wire Protocol
//!
//! JSON message shapes exchanged with clients. The transport itself
//! (websocket, SSE, test harness) is a collaborator; this module defines
//! what travels over it and the single entry point that turns an inbound
//! [`EventMessage`] into an [`EventReply`].
//!
//! Deltas are pushed, not replied: a dispatch that changes state queues a
//! [`DeltaMessage`] to every connected client of the session, while the
//! reply goes only to the sender and carries the sequence number (and
//! fault, if any) of that push.

use serde::{Deserialize, Serialize};

use crate::delta::FieldUpdate;
use crate::error::EventError;
use crate::runtime::SessionManager;
use crate::schema::NodePath;
use crate::value::Value;

/// Client-to-server: invoke a handler on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub session_id: String,
    pub node_path: NodePath,
    pub handler: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Server-to-client: one event's worth of field changes, sequenced per
/// session. A client applying deltas in `seq` order reconstructs every
/// intermediate state in production order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaMessage {
    pub session_id: String,
    pub seq: u64,
    pub updates: Vec<FieldUpdate>,
}

/// Machine-readable dispatch failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownNode,
    UnknownHandler,
    SessionNotFound,
    BadArguments,
    LockTimeout,
    ChainOverflow,
}

impl From<&EventError> for ErrorCode {
    fn from(err: &EventError) -> Self {
        match err {
            EventError::UnknownNode { .. } => ErrorCode::UnknownNode,
            EventError::UnknownHandler { .. } => ErrorCode::UnknownHandler,
            EventError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            EventError::BadArguments { .. } => ErrorCode::BadArguments,
            EventError::LockTimeout(_) => ErrorCode::LockTimeout,
            EventError::ChainOverflow(_) => ErrorCode::ChainOverflow,
        }
    }
}

/// Server-to-sender reply to one [`EventMessage`].
///
/// `Ack` means the event was dispatched: `seq` names the delta it
/// produced (absent when nothing changed) and `fault` carries an
/// application fault, which coexists with a delivered delta. `Error`
/// means the event was rejected and no handler ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventReply {
    Ack {
        seq: Option<u64>,
        fault: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl SessionManager {
    /// Dispatch an inbound event message and shape the outcome into the
    /// reply owed to its sender. Never returns `Err`: dispatch failures
    /// become [`EventReply::Error`].
    pub async fn handle_message(&self, msg: EventMessage) -> EventReply {
        match self
            .dispatch(&msg.session_id, &msg.node_path, &msg.handler, msg.args)
            .await
        {
            Ok(outcome) => EventReply::Ack {
                seq: outcome.seq,
                fault: outcome.fault.map(|f| f.message),
            },
            Err(err) => EventReply::Error {
                code: ErrorCode::from(&err),
                message: err.to_string(),
            },
        }
    }
}

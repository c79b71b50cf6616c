//! Persistence Backends
//!
//! The engine touches storage only at session boundaries: `load` when a
//! session id first appears, `save` when it is evicted. Anything beyond
//! that (durability, replication, expiry of stored snapshots) belongs
//! to the backend implementation, not to this crate.

use dashmap::DashMap;

use crate::error::BackendError;
use crate::state::TreeSnapshot;

/// Storage collaborator called at session boundaries.
pub trait StateBackend: Send + Sync {
    /// Fetch the stored snapshot for a session id, if any.
    fn load(&self, session_id: &str) -> Result<Option<TreeSnapshot>, BackendError>;

    /// Persist a snapshot for a session id, replacing any previous one.
    fn save(&self, session_id: &str, snapshot: &TreeSnapshot) -> Result<(), BackendError>;
}

/// In-process backend keeping MessagePack-encoded snapshots in a
/// concurrent map. Suitable for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    store: DashMap<String, Vec<u8>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_count(&self) -> usize {
        self.store.len()
    }
}

impl StateBackend for InMemoryBackend {
    fn load(&self, session_id: &str) -> Result<Option<TreeSnapshot>, BackendError> {
        match self.store.get(session_id) {
            Some(bytes) => {
                let snapshot = rmp_serde::from_slice(&bytes)
                    .map_err(|e| BackendError::Decode(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn save(&self, session_id: &str, snapshot: &TreeSnapshot) -> Result<(), BackendError> {
        let bytes =
            rmp_serde::to_vec(snapshot).map_err(|e| BackendError::Encode(e.to_string()))?;
        self.store.insert(session_id.to_string(), bytes);
        Ok(())
    }
}

/// Backend that stores nothing: evicted sessions restart from schema
/// defaults. For purely ephemeral state.
#[derive(Debug, Default)]
pub struct EphemeralBackend;

impl StateBackend for EphemeralBackend {
    fn load(&self, _session_id: &str) -> Result<Option<TreeSnapshot>, BackendError> {
        Ok(None)
    }

    fn save(&self, _session_id: &str, _snapshot: &TreeSnapshot) -> Result<(), BackendError> {
        Ok(())
    }
}

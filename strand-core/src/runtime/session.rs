//! Sessions and the Session Manager
//!
//! One [`Session`] owns one state tree, its broadcast cache, the
//! connected client handles, and an ordered outbox. The
//! [`SessionManager`] maps session ids to sessions in a concurrent map
//! (creation, eviction, and dispatch lookups race freely), runs the full
//! dispatch pipeline, and drives the eviction policies.
//!
//! # Ordering and Lock Discipline
//!
//! A pass sequences and queues its delta *while the lock path is still
//! held*, which pins delivery order to dispatch order. The actual fan-out
//! to clients runs on a per-session broadcaster task that holds no node
//! lock, so a slow or dead client can never stall dispatch for its own
//! session or any other. Eviction takes the same root lock as dispatch
//! and therefore never interleaves with a mid-flight event.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::delta::BroadcastCache;
use crate::error::{BackendError, EventError};
use crate::protocol::DeltaMessage;
use crate::runtime::backend::StateBackend;
use crate::runtime::dispatcher::{self, ChainedEvent, DispatchOutcome, DispatchPhase};
use crate::schema::{NodeId, NodePath, Schema};
use crate::state::{acquire_lock_path, StateTree};
use crate::value::Value;

/// Identifier for one connected client within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct ClientHandle {
    id: ClientId,
    tx: mpsc::UnboundedSender<DeltaMessage>,
}

/// One client-visible instance of the state tree.
pub struct Session {
    id: String,
    tree: Mutex<StateTree>,
    cache: Mutex<BroadcastCache>,
    clients: RwLock<Vec<ClientHandle>>,
    /// Monotonic delta sequence, stamped under the root lock.
    seq: AtomicU64,
    /// Ordered delta queue drained by the broadcaster task.
    outbox: mpsc::UnboundedSender<DeltaMessage>,
    last_access: Mutex<Instant>,
    /// Set under the root lock when the session is snapshotted and
    /// removed. A dispatch that raced the eviction sees it after
    /// acquiring its lock path and retries against a reloaded session
    /// instead of mutating the orphaned tree.
    evicted: AtomicBool,
}

impl Session {
    fn new(
        id: String,
        tree: StateTree,
        cache: BroadcastCache,
    ) -> (Arc<Self>, UnboundedReceiver<DeltaMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            id,
            tree: Mutex::new(tree),
            cache: Mutex::new(cache),
            clients: RwLock::new(Vec::new()),
            seq: AtomicU64::new(0),
            outbox: tx,
            last_access: Mutex::new(Instant::now()),
            evicted: AtomicBool::new(false),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Read access to the live tree, for inspection and tests. Takes the
    /// tree's short-lived data mutex, not the node execution locks.
    pub fn with_tree<R>(&self, f: impl FnOnce(&StateTree) -> R) -> R {
        f(&self.tree.lock())
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().elapsed()
    }

    /// Clone out the lock handles for a precomputed lock path.
    fn lock_handles(&self, path: &[NodeId]) -> Vec<Arc<tokio::sync::Mutex<()>>> {
        let tree = self.tree.lock();
        path.iter().map(|&id| tree.node(id).lock_handle()).collect()
    }
}

/// Fan deltas out to connected clients, in outbox order. Runs until the
/// session is dropped. Holds no node lock; a client that disconnected
/// mid-broadcast is pruned without failing the batch.
fn spawn_broadcaster(session: &Arc<Session>, mut rx: UnboundedReceiver<DeltaMessage>) {
    let weak = Arc::downgrade(session);
    tokio::spawn(async move {
        while let Some(delta) = rx.recv().await {
            let Some(session) = weak.upgrade() else { break };
            let mut stale = Vec::new();
            {
                let clients = session.clients.read();
                for client in clients.iter() {
                    if client.tx.send(delta.clone()).is_err() {
                        warn!(
                            session = %session.id,
                            client = ?client.id,
                            "client disconnected during broadcast, skipping"
                        );
                        stale.push(client.id);
                    }
                }
            }
            if !stale.is_empty() {
                session.clients.write().retain(|c| !stale.contains(&c.id));
            }
        }
    });
}

/// Outcome of one dispatch pass attempt.
enum Pass {
    Done(DispatchOutcome, Vec<ChainedEvent>),
    /// The session was evicted between fetching its handle and acquiring
    /// the lock path; the pass must rerun on a reloaded session.
    Evicted,
}

/// Owns all live sessions for one schema and runs the event pipeline.
pub struct SessionManager {
    schema: Arc<Schema>,
    config: EngineConfig,
    backend: Arc<dyn StateBackend>,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionManager {
    pub fn new(schema: Arc<Schema>, config: EngineConfig, backend: Arc<dyn StateBackend>) -> Self {
        Self {
            schema,
            config,
            backend,
            sessions: DashMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Fetch a live session, lazily creating it: the backend is asked
    /// first, and a miss starts a fresh tree from schema defaults.
    pub fn get_or_create(&self, session_id: &str) -> Result<Arc<Session>, BackendError> {
        if let Some(session) = self.sessions.get(session_id) {
            session.touch();
            return Ok(Arc::clone(&session));
        }

        match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => {
                let session = Arc::clone(entry.get());
                session.touch();
                Ok(session)
            }
            Entry::Vacant(entry) => {
                let tree = match self.backend.load(session_id)? {
                    Some(snapshot) => StateTree::restore(&self.schema, &snapshot)?,
                    None => StateTree::new(&self.schema),
                };
                let cache = BroadcastCache::from_tree(&self.schema, &tree);
                let (session, rx) = Session::new(session_id.to_string(), tree, cache);
                spawn_broadcaster(&session, rx);
                info!(session = session_id, "session created");
                entry.insert(Arc::clone(&session));
                Ok(session)
            }
        }
    }

    /// Fetch a live session without creating one.
    pub fn get_existing(&self, session_id: &str) -> Result<Arc<Session>, EventError> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| EventError::SessionNotFound(session_id.to_string()))
    }

    /// Attach a client to a session. The returned receiver yields this
    /// session's deltas in dispatch order.
    pub fn connect(
        &self,
        session_id: &str,
    ) -> Result<(ClientId, UnboundedReceiver<DeltaMessage>), BackendError> {
        let session = self.get_or_create(session_id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::next();
        session.clients.write().push(ClientHandle { id, tx });
        debug!(session = session_id, client = ?id, "client connected");
        Ok((id, rx))
    }

    pub fn disconnect(&self, session_id: &str, client: ClientId) {
        if let Some(session) = self.sessions.get(session_id) {
            session.clients.write().retain(|c| c.id != client);
        }
    }

    /// Queue a delta for fan-out to a session's clients.
    pub fn broadcast(&self, session_id: &str, delta: DeltaMessage) -> Result<(), EventError> {
        let session = self.get_existing(session_id)?;
        let _ = session.outbox.send(delta);
        Ok(())
    }

    /// Dispatch one event: resolve, lock, execute, recompute, diff, and
    /// queue the delta; then run any chained passes the handler enqueued.
    ///
    /// Returns the initial pass's outcome. Chained passes queue their own
    /// deltas; a chained pass that fails to resolve drops the remainder
    /// of its chain but does not retract deltas already queued.
    pub async fn dispatch(
        &self,
        session_id: &str,
        node_path: &NodePath,
        handler: &str,
        args: Vec<Value>,
    ) -> Result<DispatchOutcome, EventError> {
        let mut session = self.get_or_create(session_id).map_err(|e| {
            warn!(session = session_id, error = %e, "session load failed");
            EventError::SessionNotFound(session_id.to_string())
        })?;
        session.touch();

        let mut queue = VecDeque::from([ChainedEvent {
            node_path: node_path.clone(),
            handler: handler.to_string(),
            args,
        }]);
        let mut budget = self.config.max_chained_events;
        let mut first: Option<DispatchOutcome> = None;

        while let Some(event) = queue.pop_front() {
            if budget == 0 {
                warn!(session = session_id, "chained event budget exhausted");
                return Err(EventError::ChainOverflow(self.config.max_chained_events));
            }
            budget -= 1;

            // An eviction can win the lock race after we fetched the
            // session handle; the pass reports that and we rerun it
            // against the session reloaded from its snapshot.
            let pass = loop {
                match self.run_one(&session, &event).await {
                    Ok(Pass::Done(outcome, chained)) => break Ok((outcome, chained)),
                    Ok(Pass::Evicted) => match self.get_or_create(session_id) {
                        Ok(reloaded) => {
                            reloaded.touch();
                            session = reloaded;
                        }
                        Err(e) => {
                            warn!(session = session_id, error = %e, "session reload failed");
                            break Err(EventError::SessionNotFound(session_id.to_string()));
                        }
                    },
                    Err(err) => break Err(err),
                }
            };

            match pass {
                Ok((outcome, chained)) => {
                    queue.extend(chained);
                    if first.is_none() {
                        first = Some(outcome);
                    }
                }
                Err(err) if first.is_none() => return Err(err),
                Err(err) => {
                    warn!(
                        session = session_id,
                        handler = %event.handler,
                        error = %err,
                        "chained event failed, dropping remainder of chain"
                    );
                    break;
                }
            }
        }

        Ok(first.expect("at least one pass ran"))
    }

    /// One pass through the dispatch state machine.
    async fn run_one(
        &self,
        session: &Arc<Session>,
        event: &ChainedEvent,
    ) -> Result<Pass, EventError> {
        let node = self
            .schema
            .resolve(&event.node_path)
            .ok_or_else(|| EventError::UnknownNode {
                path: event.node_path.to_string(),
            })?;
        let handler =
            self.schema
                .handler(node, &event.handler)
                .ok_or_else(|| EventError::UnknownHandler {
                    path: event.node_path.to_string(),
                    handler: event.handler.clone(),
                })?;
        dispatcher::check_args(handler, &event.args)?;

        debug!(
            session = %session.id,
            phase = %DispatchPhase::Locked,
            handler = %handler.name,
            "acquiring lock path"
        );
        let handles = session.lock_handles(&handler.lock_path);
        let guards = acquire_lock_path(handles, self.config.lock_timeout).await?;

        // Eviction and dispatch contend on the root lock; if eviction got
        // there first this tree is an orphan and mutating it would lose
        // the update behind the persisted snapshot.
        if session.evicted.load(Ordering::SeqCst) {
            debug!(session = %session.id, "session evicted while locking, retrying");
            return Ok(Pass::Evicted);
        }

        let (result, seq) = {
            let mut tree = session.tree.lock();
            let mut cache = session.cache.lock();
            let result = dispatcher::run_pass(
                &self.schema,
                &mut tree,
                &mut cache,
                node,
                handler,
                &event.args,
            );

            // Sequence and queue under the lock path so delivery order
            // equals dispatch order; empty deltas produce no traffic.
            let seq = if result.updates.is_empty() {
                None
            } else {
                let seq = session.seq.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = session.outbox.send(DeltaMessage {
                    session_id: session.id.clone(),
                    seq,
                    updates: result.updates.clone(),
                });
                Some(seq)
            };
            (result, seq)
        };
        drop(guards);

        Ok(Pass::Done(
            DispatchOutcome {
                seq,
                updates: result.updates,
                fault: result.fault,
            },
            result.chained,
        ))
    }

    /// Evict a session: snapshot, save through the backend, drop the live
    /// tree. Takes the root execution lock first, so an event mid-dispatch
    /// always completes (delta included) before the tree goes away, and
    /// marks the session so a dispatch still waiting on the lock retries
    /// against the reloaded session instead of the orphaned tree.
    pub async fn evict(&self, session_id: &str) -> Result<bool, BackendError> {
        let Some(session) = self.sessions.get(session_id).map(|s| Arc::clone(&s)) else {
            return Ok(false);
        };

        let root = {
            let tree = session.tree.lock();
            tree.node(self.schema.root()).lock_handle()
        };
        let _guard = root.lock().await;
        session.evicted.store(true, Ordering::SeqCst);

        let snapshot = session.tree.lock().snapshot();
        self.backend.save(session_id, &snapshot)?;
        self.sessions.remove(session_id);
        info!(session = session_id, "session evicted");
        Ok(true)
    }

    /// Evict every session idle longer than the configured TTL. Returns
    /// the number evicted; per-session failures are logged, not fatal.
    pub async fn evict_idle(&self) -> usize {
        let ttl = self.config.session_ttl;
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in idle {
            match self.evict(&id).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!(session = %id, error = %e, "idle eviction failed"),
            }
        }
        evicted
    }

    /// Evict least-recently-used sessions until the count is within the
    /// configured capacity.
    pub async fn enforce_capacity(&self) -> usize {
        let mut evicted = 0;
        while self.sessions.len() > self.config.max_sessions {
            let Some(oldest) = self
                .sessions
                .iter()
                .max_by_key(|entry| entry.value().idle_for())
                .map(|entry| entry.key().clone())
            else {
                break;
            };
            match self.evict(&oldest).await {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(session = %oldest, error = %e, "capacity eviction failed");
                    break;
                }
            }
        }
        evicted
    }
}

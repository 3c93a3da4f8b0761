//! Document session: one Yrs document, its presence and its connections.
//!
//! ```text
//! conn A ─┐                         ┌─────────────── SessionState ──────────────┐
//! conn B ─┼─ dispatch(id, msg) ──►  │ Doc ──observer──► merged deltas channel    │
//! conn C ─┘      (Mutex)            │ AwarenessRegistry    clients    eviction   │
//!                                   └──────────────┬────────────────────────────┘
//!                                                  │ Dispatch { reply, broadcast }
//!                                   reply ◄────────┴────────► BroadcastGroup
//!                                  (sender)                   (everyone else)
//! ```
//!
//! [`SessionState`] is plain synchronous code: apply one decoded message,
//! return the bytes to reply with and the bytes to fan out. The document's
//! update observer feeds an internal channel that `apply` drains, so the
//! rebroadcast carries the delta Yrs actually merged rather than the bytes
//! the client sent. [`DocumentSession`] wraps the state in a mutex so frames
//! for one document are processed strictly one at a time while different
//! documents run in parallel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Subscription, Transact, Update};

use crate::awareness::AwarenessRegistry;
use crate::broadcast::{BroadcastGroup, BroadcastStats, Frame};
use crate::error::RelayError;
use crate::protocol::{self, AwarenessChange, Message, SyncMessage};

/// Process-local connection id, also used as the connection's awareness id.
pub type ConnectionId = u64;

/// A connected client as seen from inside its session.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    pub id: ConnectionId,
    pub addr: Option<SocketAddr>,
    pub connected_at: Instant,
    pub last_activity: Instant,
    /// Awareness client ids whose live state arrived on this connection.
    controlled: HashSet<u64>,
}

impl ClientConnection {
    pub fn new(id: ConnectionId, addr: Option<SocketAddr>) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            connected_at: now,
            last_activity: now,
            controlled: HashSet::new(),
        }
    }

    /// Time since the last frame from this connection.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Awareness ids to tombstone when this connection leaves.
    ///
    /// A connection that never announced anything falls back to its own id,
    /// unless one of `others` currently speaks for that id.
    fn owned_awareness_ids<'a>(&self, mut others: impl Iterator<Item = &'a ClientConnection>) -> Vec<u64> {
        let mut ids: Vec<u64> = self.controlled.iter().copied().collect();
        if ids.is_empty() && !others.any(|other| other.controlled.contains(&self.id)) {
            ids.push(self.id);
        }
        ids.sort_unstable();
        ids
    }
}

/// What a newly joined connection needs to catch up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    /// Encoded state vector of the session document.
    pub state_vector: Vec<u8>,
    /// Every live awareness entry.
    pub awareness: Vec<AwarenessChange>,
}

impl Baseline {
    /// `STEP1` followed by the awareness snapshot, in send order.
    pub fn frames(&self) -> [Vec<u8>; 2] {
        [
            protocol::sync_step1(self.state_vector.clone()),
            protocol::awareness(self.awareness.clone()),
        ]
    }
}

/// Result of applying one message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Frame for the sender only.
    pub reply: Option<Vec<u8>>,
    /// Frames for every other connection in the session.
    pub broadcast: Vec<Vec<u8>>,
}

/// Result of a connection leaving.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Departure {
    /// Connections still in the session.
    pub remaining: usize,
    /// Awareness tombstones for the departed connection, if any were live.
    pub tombstones: Option<Vec<u8>>,
}

/// Idle-eviction bookkeeping, driven by the registry.
#[derive(Debug, Default)]
pub(crate) struct EvictionSlot {
    /// Bumped on every schedule and cancel; a timer only evicts if the
    /// generation it was armed with is still current.
    pub(crate) generation: u64,
    pub(crate) timer: Option<JoinHandle<()>>,
    /// Set once the session has been removed from the registry.
    pub(crate) closed: bool,
}

impl EvictionSlot {
    pub(crate) fn cancel(&mut self) -> bool {
        self.generation += 1;
        match self.timer.take() {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }
}

/// Mutable state of one session. Only touched under the session lock.
pub struct SessionState {
    doc: Doc,
    merged: mpsc::Receiver<Vec<u8>>,
    _observer: Subscription,
    awareness: AwarenessRegistry,
    pub(crate) clients: HashMap<ConnectionId, ClientConnection>,
    pub(crate) eviction: EvictionSlot,
}

impl SessionState {
    pub fn new() -> Result<Self, RelayError> {
        let doc = Doc::new();
        let (tx, merged) = mpsc::channel();
        let observer = doc
            .observe_update_v1(move |_txn, event| {
                let _ = tx.send(event.update.clone());
            })
            .map_err(|_| RelayError::Merge("document is already borrowed".to_string()))?;
        Ok(Self {
            doc,
            merged,
            _observer: observer,
            awareness: AwarenessRegistry::new(),
            clients: HashMap::new(),
            eviction: EvictionSlot::default(),
        })
    }

    /// Register `conn`, then compute its baseline.
    ///
    /// Registration comes first: anything merged afterwards reaches the new
    /// connection by broadcast, and anything it also gets through the
    /// baseline is an idempotent duplicate.
    pub fn join(&mut self, conn: ClientConnection) -> Result<Baseline, RelayError> {
        if self.eviction.closed {
            return Err(RelayError::SessionClosed);
        }
        if self.eviction.cancel() {
            log::debug!("Eviction cancelled: connection {} joined", conn.id);
        }
        self.clients.insert(conn.id, conn);
        Ok(Baseline {
            state_vector: self.state_vector(),
            awareness: self.awareness.snapshot(),
        })
    }

    /// Remove a connection and tombstone the presence it owned.
    ///
    /// Tombstones are only worth sending while someone is left to see them.
    pub fn leave(&mut self, id: ConnectionId) -> Departure {
        let Some(conn) = self.clients.remove(&id) else {
            return Departure {
                remaining: self.clients.len(),
                tombstones: None,
            };
        };
        log::debug!(
            "Connection {id} ({}) leaving after {:?}, idle for {:?}",
            conn.addr.map_or_else(|| "local".to_string(), |addr| addr.to_string()),
            conn.connected_at.elapsed(),
            conn.idle_for()
        );
        let removed: Vec<AwarenessChange> = conn
            .owned_awareness_ids(self.clients.values())
            .into_iter()
            .filter_map(|client_id| self.awareness.remove_client(client_id))
            .collect();
        let remaining = self.clients.len();
        let tombstones = (remaining > 0 && !removed.is_empty()).then(|| protocol::awareness(removed));
        Departure {
            remaining,
            tombstones,
        }
    }

    /// Apply one decoded message from connection `origin`.
    pub fn apply(&mut self, origin: ConnectionId, msg: Message) -> Result<Dispatch, RelayError> {
        if let Some(conn) = self.clients.get_mut(&origin) {
            conn.last_activity = Instant::now();
        }
        match msg {
            Message::Sync(sync) => self.apply_sync(sync),
            Message::Awareness(changes) => Ok(self.apply_awareness(origin, changes)),
        }
    }

    fn apply_sync(&mut self, msg: SyncMessage) -> Result<Dispatch, RelayError> {
        match msg {
            // Catch-up is peer-specific: answer the sender, never broadcast.
            SyncMessage::Step1(state_vector) => {
                let remote = protocol::decode_state_vector(&state_vector)?;
                let diff = self.doc.transact().encode_diff_v1(&remote);
                Ok(Dispatch {
                    reply: Some(protocol::sync_step2(diff)),
                    broadcast: Vec::new(),
                })
            }
            SyncMessage::Step2(update) | SyncMessage::Update(update) => {
                let merged = self.apply_update(&update)?;
                Ok(Dispatch {
                    reply: None,
                    broadcast: merged.into_iter().map(protocol::sync_update).collect(),
                })
            }
        }
    }

    /// Merge an update, returning the deltas the document reported.
    ///
    /// An update that changes nothing (duplicate, or still waiting on
    /// missing dependencies) yields no delta. Yrs panics on some malformed
    /// updates; that panic is caught here and reported as a merge failure.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<Vec<Vec<u8>>, RelayError> {
        let doc = &self.doc;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let update = Update::decode_v1(update).map_err(|e| RelayError::Merge(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update).map_err(|e| RelayError::Merge(e.to_string()))
        }));
        let merged: Vec<Vec<u8>> = self.merged.try_iter().collect();
        match result {
            Ok(Ok(())) => Ok(merged),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RelayError::Merge("update rejected by the document decoder".to_string())),
        }
    }

    fn apply_awareness(&mut self, origin: ConnectionId, changes: Vec<AwarenessChange>) -> Dispatch {
        let applied = self.awareness.apply_remote(changes);
        // An id belongs to whichever connection last set it live.
        for change in &applied {
            for (id, conn) in self.clients.iter_mut() {
                if *id == origin && !change.is_tombstone() {
                    conn.controlled.insert(change.client_id);
                } else {
                    conn.controlled.remove(&change.client_id);
                }
            }
        }
        Dispatch {
            reply: None,
            broadcast: if applied.is_empty() {
                Vec::new()
            } else {
                vec![protocol::awareness(applied)]
            },
        }
    }

    /// Tombstone presence not refreshed within `timeout` and forget old
    /// tombstones. Returns the frame announcing the new tombstones.
    pub fn sweep_awareness(&mut self, timeout: Duration, tombstone_grace: Duration) -> Option<Vec<u8>> {
        let pruned = self.awareness.prune_tombstones(tombstone_grace);
        if pruned > 0 {
            log::trace!("Awareness: pruned {pruned} tombstones");
        }
        let removed = self.awareness.remove_stale(timeout);
        for conn in self.clients.values_mut() {
            for change in &removed {
                conn.controlled.remove(&change.client_id);
            }
        }
        (!removed.is_empty()).then(|| protocol::awareness(removed))
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// The whole document as a single update.
    pub fn full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    pub fn awareness(&self) -> &AwarenessRegistry {
        &self.awareness
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, id: ConnectionId) -> Option<&ClientConnection> {
        self.clients.get(&id)
    }
}

/// A session shared by every connection addressing the same document name.
pub struct DocumentSession {
    name: String,
    state: Mutex<SessionState>,
    broadcast: BroadcastGroup,
}

impl DocumentSession {
    pub fn new(name: impl Into<String>, broadcast_capacity: usize) -> Result<Self, RelayError> {
        Ok(Self {
            name: name.into(),
            state: Mutex::new(SessionState::new()?),
            broadcast: BroadcastGroup::new(broadcast_capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }

    /// Register `conn` and hand back its baseline plus its fan-out receiver.
    ///
    /// Fails with [`RelayError::SessionClosed`] if the session was evicted
    /// after it was looked up.
    pub async fn join(
        &self,
        conn: ClientConnection,
    ) -> Result<(Baseline, broadcast::Receiver<Arc<Frame>>), RelayError> {
        let mut state = self.state.lock().await;
        let id = conn.id;
        let rx = self.broadcast.subscribe();
        let baseline = state.join(conn)?;
        log::info!(
            "Connection {id} joined '{}' ({} connected)",
            self.name,
            state.client_count()
        );
        Ok((baseline, rx))
    }

    /// Remove a connection. Returns how many remain.
    pub async fn leave(&self, id: ConnectionId) -> usize {
        let mut state = self.state.lock().await;
        let departure = state.leave(id);
        if let Some(frame) = departure.tombstones {
            self.broadcast.broadcast(id, frame);
        }
        log::info!(
            "Connection {id} left '{}' ({} connected)",
            self.name,
            departure.remaining
        );
        departure.remaining
    }

    /// Apply a message from `origin`, fan out the result and return the
    /// sender's reply, if any.
    pub async fn dispatch(&self, origin: ConnectionId, msg: Message) -> Result<Option<Vec<u8>>, RelayError> {
        let mut state = self.state.lock().await;
        let dispatch = state.apply(origin, msg)?;
        for frame in dispatch.broadcast {
            self.broadcast.broadcast(origin, frame);
        }
        Ok(dispatch.reply)
    }

    pub async fn handle_sync(&self, origin: ConnectionId, msg: SyncMessage) -> Result<Option<Vec<u8>>, RelayError> {
        self.dispatch(origin, Message::Sync(msg)).await
    }

    pub async fn handle_awareness(&self, origin: ConnectionId, changes: Vec<AwarenessChange>) -> Result<(), RelayError> {
        self.dispatch(origin, Message::Awareness(changes)).await.map(|_| ())
    }

    /// Run the stale-presence sweep, broadcasting any tombstones once.
    pub async fn sweep_awareness(&self, timeout: Duration, tombstone_grace: Duration) -> bool {
        let mut state = self.state.lock().await;
        match state.sweep_awareness(timeout, tombstone_grace) {
            Some(frame) => {
                self.broadcast.broadcast(crate::broadcast::RELAY_ORIGIN, frame);
                true
            }
            None => false,
        }
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.client_count()
    }

    pub async fn state_vector(&self) -> Vec<u8> {
        self.state.lock().await.state_vector()
    }

    pub async fn full_state(&self) -> Vec<u8> {
        self.state.lock().await.full_state()
    }

    pub async fn awareness_snapshot(&self) -> Vec<AwarenessChange> {
        self.state.lock().await.awareness().snapshot()
    }

    pub(crate) fn broadcast_group(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.broadcast.stats()
    }
}

//! Session registry: document name → live session, plus idle eviction.
//!
//! Lookups take a read lock, so the common "session exists" path never
//! blocks other readers. Creation double-checks under the write lock, so
//! concurrent first connections to a name end up in one session.
//!
//! Eviction is armed when a session's last connection leaves and races
//! against joins through a generation counter kept under the session lock:
//!
//! ```text
//! leave (0 left) ── schedule: gen += 1, spawn timer(gen)
//!                        │
//!     join ── cancel: gen += 1, abort timer        timer fires after grace
//!                                                        │
//!                         registry write lock ─► session lock ─► gen unchanged
//!                         and still empty? ─► closed = true, remove from map
//! ```
//!
//! A join that loses the race finds the session closed and retries against a
//! fresh one, so a session is never evicted while it has a connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, RwLock};

use crate::broadcast::Frame;
use crate::error::RelayError;
use crate::session::{Baseline, ClientConnection, ConnectionId, DocumentSession};

/// Counters for the registry's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub live_sessions: usize,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<DocumentSession>>>,
    eviction_grace: Duration,
    broadcast_capacity: usize,
    next_connection: AtomicU64,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl SessionRegistry {
    pub fn new(eviction_grace: Duration, broadcast_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            eviction_grace,
            broadcast_capacity,
            // 0 is reserved for frames the relay originates itself
            next_connection: AtomicU64::new(1),
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Allocate a process-unique connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Return the session for `name`, creating it on first use.
    pub async fn get_or_create(&self, name: &str) -> Result<Arc<DocumentSession>, RelayError> {
        // Fast path: read lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(name) {
                return Ok(session.clone());
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check after acquiring write lock
        if let Some(session) = sessions.get(name) {
            return Ok(session.clone());
        }

        let session = Arc::new(DocumentSession::new(name, self.broadcast_capacity)?);
        sessions.insert(name.to_string(), session.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        log::info!("Session '{name}' created ({} live)", sessions.len());
        Ok(session)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(name).cloned()
    }

    /// Resolve `name` and join `conn` to it, retrying if the session is
    /// evicted in between.
    pub async fn join(
        &self,
        name: &str,
        conn: ClientConnection,
    ) -> Result<(Arc<DocumentSession>, Baseline, broadcast::Receiver<Arc<Frame>>), RelayError> {
        loop {
            let session = self.get_or_create(name).await?;
            match session.join(conn.clone()).await {
                Ok((baseline, rx)) => return Ok((session, baseline, rx)),
                Err(RelayError::SessionClosed) => {
                    log::debug!("Session '{name}' closed during join, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove a connection from `session`; arm eviction if it was the last.
    pub async fn leave(self: &Arc<Self>, session: &Arc<DocumentSession>, id: u64) {
        if session.leave(id).await == 0 {
            self.schedule_eviction(session, self.eviction_grace).await;
        }
    }

    /// Arm (or re-arm) the eviction timer of an empty session.
    ///
    /// No-op if the session has connections or is already closed.
    pub async fn schedule_eviction(self: &Arc<Self>, session: &Arc<DocumentSession>, grace: Duration) {
        let mut state = session.lock().await;
        if state.eviction.closed || !state.clients.is_empty() {
            return;
        }
        state.eviction.cancel();
        let generation = state.eviction.generation;

        let registry = Arc::clone(self);
        let target = Arc::clone(session);
        state.eviction.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.evict(&target, generation).await;
        }));
        log::debug!(
            "Session '{}' empty, eviction in {}ms",
            session.name(),
            grace.as_millis()
        );
    }

    /// Cancel a pending eviction. Returns whether a timer was pending.
    pub async fn cancel_eviction(&self, name: &str) -> bool {
        let Some(session) = self.get(name).await else {
            return false;
        };
        let mut state = session.lock().await;
        if state.eviction.closed {
            return false;
        }
        state.eviction.cancel()
    }

    /// Remove `session` if it is still registered, still empty, and no join
    /// or reschedule happened since the timer for `generation` was armed.
    async fn evict(&self, session: &Arc<DocumentSession>, generation: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        let mut state = session.lock().await;
        if state.eviction.closed
            || state.eviction.generation != generation
            || !state.clients.is_empty()
        {
            return false;
        }
        let registered = sessions
            .get(session.name())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !registered {
            return false;
        }

        state.eviction.closed = true;
        // Dropping our own handle detaches it; the task ends right after.
        state.eviction.timer = None;
        sessions.remove(session.name());
        self.evicted.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Session '{}' evicted after idle grace ({} live)",
            session.name(),
            sessions.len()
        );
        true
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn session_names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn sessions(&self) -> Vec<Arc<DocumentSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        RegistryStats {
            live_sessions: self.session_count().await,
            sessions_created: self.created.load(Ordering::Relaxed),
            sessions_evicted: self.evicted.load(Ordering::Relaxed),
        }
    }

    /// Drop every session and cancel every pending eviction.
    pub async fn shutdown(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let drained = sessions.len();
        for (_, session) in sessions.drain() {
            let mut state = session.lock().await;
            state.eviction.cancel();
            state.eviction.closed = true;
        }
        log::info!("Registry drained: {drained} sessions discarded");
        drained
    }
}

//! WebSocket relay server with name-addressed document sessions.
//!
//! Architecture:
//! ```text
//! ws://host/<name>
//!   Client A ──┐                                   ┌──► Client B
//!              ├── SessionRegistry ── DocumentSession ──┤
//!   Client B ──┘      (name → session)   │  yrs Doc     └──► Client C
//!                                        │  AwarenessRegistry
//!                                        └─ BroadcastGroup
//! ```
//!
//! Each session keeps:
//! - A yrs `Doc` holding the authoritative merged state
//! - An awareness registry of ephemeral presence
//! - A `BroadcastGroup` for fan-out to connected peers
//!
//! Nothing is persisted: a session lives from its first join until the
//! eviction grace after its last leave.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RelayConfig;
use crate::connection;
use crate::error::RelayError;
use crate::registry::SessionRegistry;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    /// Binary frames read from clients
    pub frames_received: u64,
    /// Frames that failed to decode and were dropped
    pub frames_dropped: u64,
    /// Updates the document refused to merge
    pub merge_failures: u64,
    /// Broadcast frames written to client sockets
    pub frames_forwarded: u64,
    /// Broadcast frames lost to slow receivers
    pub frames_lagged: u64,
    pub live_sessions: usize,
    pub sessions_created: u64,
    pub sessions_evicted: u64,
}

/// Lock-free connection and frame counters, shared by every connection task.
#[derive(Debug, Default)]
pub struct AtomicRelayStats {
    pub(crate) total_connections: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) frames_received: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) merge_failures: AtomicU64,
    pub(crate) frames_forwarded: AtomicU64,
    pub(crate) frames_lagged: AtomicU64,
}

impl AtomicRelayStats {
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn connection_opened(&self) {
        Self::add(&self.total_connections, 1);
        Self::add(&self.active_connections, 1);
    }

    pub(crate) fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Point-in-time copy; session counts are left at zero.
    pub fn snapshot(&self) -> RelayStats {
        RelayStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            merge_failures: self.merge_failures.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_lagged: self.frames_lagged.load(Ordering::Relaxed),
            ..RelayStats::default()
        }
    }
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicRelayStats>,
    /// Flipped to `true` once; every connection task watches it.
    shutdown: watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.eviction_grace,
            config.broadcast_capacity,
        ));
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            registry,
            stats: Arc::new(AtomicRelayStats::default()),
            shutdown,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind `config.bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until accepting fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every live connection and
    /// drain every session.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), RelayError>
    where
        F: Future<Output = ()>,
    {
        log::info!("Relay listening on {}", listener.local_addr()?);
        let sweeper = self.spawn_sweeper();
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            break Err(RelayError::from(e));
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let registry = self.registry.clone();
                    let stats = self.stats.clone();
                    let closing = self.shutdown.subscribe();
                    tokio::spawn(async move {
                        if let Err(e) = connection::handle_connection(stream, addr, registry, stats, closing).await {
                            log::warn!("Connection from {addr} ended: {e}");
                        }
                    });
                }

                () = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break Ok(());
                }
            }
        };

        sweeper.abort();
        self.shutdown.send_replace(true);
        self.registry.shutdown().await;
        result
    }

    /// Periodically tombstone silent presence in every live session.
    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let timeout = self.config.awareness_timeout;
        let grace = self.config.tombstone_grace;
        // tokio rejects a zero period
        let period = self.config.awareness_sweep_interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for session in registry.sessions().await {
                    if session.sweep_awareness(timeout, grace).await {
                        log::debug!("Swept stale presence in '{}'", session.name());
                    }
                }
            }
        })
    }

    /// Get server statistics.
    pub async fn stats(&self) -> RelayStats {
        let registry = self.registry.stats().await;
        let mut stats = self.stats.snapshot();
        stats.live_sessions = registry.live_sessions;
        stats.sessions_created = registry.sessions_created;
        stats.sessions_evicted = registry.sessions_evicted;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.config().bind_addr, "127.0.0.1:1234");
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let server = RelayServer::with_defaults();
        assert_eq!(server.stats().await, RelayStats::default());
    }

    #[tokio::test]
    async fn test_shutdown_drains_sessions() {
        let server = RelayServer::with_defaults();
        server.registry().get_or_create("doc").await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server
            .serve_with_shutdown(listener, async {})
            .await
            .unwrap();

        assert_eq!(server.registry().session_count().await, 0);
        assert_eq!(server.stats().await.sessions_created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_expires_silent_presence() {
        let config = RelayConfig {
            awareness_timeout: Duration::from_secs(2),
            awareness_sweep_interval: Duration::from_secs(1),
            ..RelayConfig::default()
        };
        let server = RelayServer::new(config);
        let session = server.registry().get_or_create("doc").await.unwrap();
        session
            .handle_awareness(1, vec![crate::protocol::AwarenessChange::live(7, 1, b"{}".to_vec())])
            .await
            .unwrap();
        assert_eq!(session.awareness_snapshot().await.len(), 1);

        let sweeper = server.spawn_sweeper();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(session.awareness_snapshot().await.is_empty());
        sweeper.abort();
    }
}

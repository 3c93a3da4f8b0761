//! Fan-out of encoded frames to every connection of one document session.
//!
//! One tokio broadcast channel per session gives O(1) send to all
//! subscribers. Each frame carries the id of the connection it originated
//! from so a receiver can skip its own echoes. Delivery is best-effort: a
//! receiver that falls more than `capacity` frames behind loses the oldest
//! ones and is told how many it missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::session::ConnectionId;

/// Origin used for frames the relay produces itself (sweeper tombstones).
pub const RELAY_ORIGIN: ConnectionId = 0;

/// An encoded frame plus the connection that caused it.
#[derive(Debug)]
pub struct Frame {
    pub origin: ConnectionId,
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Whether the connection `id` should receive this frame.
    pub fn is_for(&self, id: ConnectionId) -> bool {
        self.origin != id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

/// Broadcast group for a single document session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Frame>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` frames are buffered per receiver before it starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Frame>> {
        self.sender.subscribe()
    }

    /// Publish `bytes` to every subscriber; the origin filters itself out.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, origin: ConnectionId, bytes: Vec<u8>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Frame { origin, bytes }))
            .unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a receiver skipped `missed` frames.
    pub fn record_lag(&self, missed: u64) {
        self.stats.frames_lagged.fetch_add(missed, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.stats.frames_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        // All subscribers get it, including the sender; filtering is the receiver's job.
        assert_eq!(group.broadcast(1, vec![1, 2, 3]), 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            assert_eq!(frame.bytes, vec![1, 2, 3]);
            assert_eq!(frame.origin, 1);
        }
    }

    #[test]
    fn test_origin_filter() {
        let frame = Frame {
            origin: 4,
            bytes: Vec::new(),
        };
        assert!(!frame.is_for(4));
        assert!(frame.is_for(5));

        let relay = Frame {
            origin: RELAY_ORIGIN,
            bytes: Vec::new(),
        };
        assert!(relay.is_for(1));
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(1, vec![0]), 0);
        assert_eq!(group.stats().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver_is_told() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.subscribe();
        for i in 0..5u8 {
            group.broadcast(1, vec![i]);
        }
        match rx.recv().await {
            Err(RecvError::Lagged(n)) => {
                assert_eq!(n, 3);
                group.record_lag(n);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        assert_eq!(rx.recv().await.unwrap().bytes, vec![3]);
        assert_eq!(group.stats().frames_lagged, 3);
    }

    #[test]
    fn test_stats_subscribers() {
        let group = BroadcastGroup::new(8);
        let rx = group.subscribe();
        assert_eq!(group.stats().subscribers, 1);
        drop(rx);
        assert_eq!(group.stats().subscribers, 0);
        assert_eq!(group.capacity(), 8);
    }
}

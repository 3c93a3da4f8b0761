//! Awareness registry: ephemeral per-client presence for one document.
//!
//! Each client id owns a single entry with a monotonically increasing clock.
//! An incoming change replaces the stored entry only if it wins under
//! [`supersedes`]; the registry reports the accepted subset so callers fan out
//! real deltas and never echo stale retransmissions.
//!
//! ```text
//!   live(clock=n) ──update(n+1)──► live(clock=n+1)
//!        │
//!        └──leave / timeout──► tombstone(clock=n+1) ──grace──► pruned
//! ```

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::AwarenessChange;

/// Stored presence for one client id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    /// Client-defined payload; `None` marks a tombstone.
    pub state: Option<Vec<u8>>,
    pub clock: u64,
    pub last_updated: Instant,
}

impl AwarenessEntry {
    fn change(&self, client_id: u64) -> AwarenessChange {
        AwarenessChange {
            client_id,
            clock: self.clock,
            state: self.state.clone(),
        }
    }
}

/// Whether `incoming` replaces an entry currently at `clock` / `state`.
///
/// Higher clock wins. On equal clocks a tombstone beats a live state and two
/// live states are ordered by their bytes, so every replica picks the same
/// winner regardless of arrival order. An identical entry is a duplicate.
pub fn supersedes(incoming: &AwarenessChange, clock: u64, state: Option<&[u8]>) -> bool {
    if incoming.clock != clock {
        return incoming.clock > clock;
    }
    match (incoming.state.as_deref(), state) {
        (None, Some(_)) => true,
        (Some(new), Some(old)) => new > old,
        _ => false,
    }
}

/// Per-document presence table.
#[derive(Debug, Default)]
pub struct AwarenessRegistry {
    entries: HashMap<u64, AwarenessEntry>,
}

impl AwarenessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a batch of remote changes, returning those actually accepted.
    pub fn apply_remote(&mut self, changes: Vec<AwarenessChange>) -> Vec<AwarenessChange> {
        self.apply_remote_at(changes, Instant::now())
    }

    fn apply_remote_at(&mut self, changes: Vec<AwarenessChange>, now: Instant) -> Vec<AwarenessChange> {
        let mut applied = Vec::new();
        for change in changes {
            let accept = match self.entries.get(&change.client_id) {
                Some(current) => supersedes(&change, current.clock, current.state.as_deref()),
                // Unknown clients always take the change, tombstones included, so
                // a removal that overtakes its state still wins on arrival.
                None => true,
            };
            if !accept {
                log::trace!(
                    "Awareness: dropped stale change for client {} (clock {})",
                    change.client_id,
                    change.clock
                );
                continue;
            }
            self.entries.insert(
                change.client_id,
                AwarenessEntry {
                    state: change.state.clone(),
                    clock: change.clock,
                    last_updated: now,
                },
            );
            applied.push(change);
        }
        applied
    }

    /// All live (non-tombstone) entries, ordered by client id.
    pub fn snapshot(&self) -> Vec<AwarenessChange> {
        let mut live: Vec<AwarenessChange> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.state.is_some())
            .map(|(id, entry)| entry.change(*id))
            .collect();
        live.sort_by_key(|c| c.client_id);
        live
    }

    /// Replace a live entry with a clock-incremented tombstone.
    ///
    /// Returns the tombstone to broadcast, or `None` if the client has no
    /// live entry.
    pub fn remove_client(&mut self, client_id: u64) -> Option<AwarenessChange> {
        self.remove_client_at(client_id, Instant::now())
    }

    fn remove_client_at(&mut self, client_id: u64, now: Instant) -> Option<AwarenessChange> {
        let entry = self.entries.get_mut(&client_id)?;
        entry.state.as_ref()?;
        entry.clock += 1;
        entry.state = None;
        entry.last_updated = now;
        Some(entry.change(client_id))
    }

    /// Tombstone every live entry not refreshed within `max_age`.
    pub fn remove_stale(&mut self, max_age: Duration) -> Vec<AwarenessChange> {
        self.remove_stale_at(max_age, Instant::now())
    }

    fn remove_stale_at(&mut self, max_age: Duration, now: Instant) -> Vec<AwarenessChange> {
        let stale: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state.is_some() && now.duration_since(e.last_updated) >= max_age)
            .map(|(id, _)| *id)
            .collect();
        stale
            .into_iter()
            .filter_map(|id| self.remove_client_at(id, now))
            .collect()
    }

    /// Forget tombstones older than `grace`. Returns how many were pruned.
    pub fn prune_tombstones(&mut self, grace: Duration) -> usize {
        self.prune_tombstones_at(grace, Instant::now())
    }

    fn prune_tombstones_at(&mut self, grace: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.state.is_some() || now.duration_since(e.last_updated) < grace);
        before - self.entries.len()
    }

    pub fn get(&self, client_id: u64) -> Option<&AwarenessEntry> {
        self.entries.get(&client_id)
    }

    /// Number of live entries.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.state.is_some()).count()
    }

    /// Number of stored entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn live(id: u64, clock: u64, state: &str) -> AwarenessChange {
        AwarenessChange::live(id, clock, state.as_bytes().to_vec())
    }

    #[test]
    fn test_newer_clock_overwrites() {
        let mut reg = AwarenessRegistry::new();
        assert_eq!(reg.apply_remote(vec![live(1, 1, "a")]).len(), 1);
        assert_eq!(reg.apply_remote(vec![live(1, 2, "b")]).len(), 1);
        assert_eq!(reg.get(1).unwrap().state.as_deref(), Some(&b"b"[..]));
        assert_eq!(reg.get(1).unwrap().clock, 2);
    }

    #[test]
    fn test_older_clock_ignored() {
        let mut reg = AwarenessRegistry::new();
        reg.apply_remote(vec![live(1, 5, "new")]);
        let applied = reg.apply_remote(vec![live(1, 4, "old")]);
        assert!(applied.is_empty());
        assert_eq!(reg.get(1).unwrap().state.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_duplicate_suppressed() {
        let mut reg = AwarenessRegistry::new();
        reg.apply_remote(vec![live(1, 3, "x")]);
        assert!(reg.apply_remote(vec![live(1, 3, "x")]).is_empty());
    }

    #[test]
    fn test_batch_returns_only_accepted() {
        let mut reg = AwarenessRegistry::new();
        reg.apply_remote(vec![live(1, 3, "x")]);
        let applied = reg.apply_remote(vec![live(1, 2, "stale"), live(2, 1, "fresh")]);
        assert_eq!(applied, vec![live(2, 1, "fresh")]);
    }

    #[test]
    fn test_equal_clock_tombstone_wins() {
        let mut a = AwarenessRegistry::new();
        a.apply_remote(vec![live(1, 2, "here")]);
        assert_eq!(a.apply_remote(vec![AwarenessChange::tombstone(1, 2)]).len(), 1);

        let mut b = AwarenessRegistry::new();
        b.apply_remote(vec![AwarenessChange::tombstone(1, 1)]);
        b.apply_remote(vec![live(1, 1, "seed")]);
        b.apply_remote(vec![AwarenessChange::tombstone(1, 2)]);
        assert!(b.apply_remote(vec![live(1, 2, "here")]).is_empty());

        assert!(a.snapshot().is_empty());
        assert!(b.snapshot().is_empty());
    }

    #[test]
    fn test_equal_clock_bytes_order() {
        let mut reg = AwarenessRegistry::new();
        reg.apply_remote(vec![live(1, 1, "b")]);
        assert!(reg.apply_remote(vec![live(1, 1, "a")]).is_empty());
        assert_eq!(reg.apply_remote(vec![live(1, 1, "c")]).len(), 1);
    }

    #[test]
    fn test_tombstone_before_state() {
        let mut reg = AwarenessRegistry::new();
        assert_eq!(reg.apply_remote(vec![AwarenessChange::tombstone(9, 3)]).len(), 1);
        assert!(reg.snapshot().is_empty());
        // The state it removed arrives late and stays removed.
        assert!(reg.apply_remote(vec![live(9, 2, "late")]).is_empty());
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_excludes_tombstones() {
        let mut reg = AwarenessRegistry::new();
        reg.apply_remote(vec![live(2, 1, "two"), live(1, 1, "one")]);
        reg.remove_client(2);
        assert_eq!(reg.snapshot(), vec![live(1, 1, "one")]);
        assert_eq!(reg.live_count(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_client_increments_clock() {
        let mut reg = AwarenessRegistry::new();
        reg.apply_remote(vec![live(4, 7, "s")]);
        let tombstone = reg.remove_client(4).unwrap();
        assert_eq!(tombstone, AwarenessChange::tombstone(4, 8));
        // Already removed.
        assert!(reg.remove_client(4).is_none());
        // The old state cannot come back.
        assert!(reg.apply_remote(vec![live(4, 8, "s")]).is_empty());
        assert_eq!(reg.apply_remote(vec![live(4, 9, "back")]).len(), 1);
    }

    #[test]
    fn test_remove_stale_and_prune() {
        let mut reg = AwarenessRegistry::new();
        let start = Instant::now();
        reg.apply_remote_at(vec![live(1, 1, "old")], start);
        reg.apply_remote_at(vec![live(2, 1, "fresh")], start + Duration::from_secs(20));

        let now = start + Duration::from_secs(31);
        let removed = reg.remove_stale_at(Duration::from_secs(30), now);
        assert_eq!(removed, vec![AwarenessChange::tombstone(1, 2)]);
        assert_eq!(reg.snapshot(), vec![live(2, 1, "fresh")]);

        // Tombstone retained within the grace window, pruned after.
        assert_eq!(reg.prune_tombstones_at(Duration::from_secs(10), now + Duration::from_secs(5)), 0);
        assert_eq!(reg.prune_tombstones_at(Duration::from_secs(10), now + Duration::from_secs(10)), 1);
        assert!(reg.get(1).is_none());
        assert!(reg.get(2).is_some());
    }

    fn arb_change() -> impl Strategy<Value = AwarenessChange> {
        (0u64..3, 0u64..4, proptest::option::of(proptest::collection::vec(0u8..4, 0..3)))
            .prop_map(|(client_id, clock, state)| AwarenessChange { client_id, clock, state })
    }

    proptest! {
        #[test]
        fn prop_order_independent(changes in proptest::collection::vec(arb_change(), 0..24)) {
            let mut forward = AwarenessRegistry::new();
            for c in changes.clone() {
                forward.apply_remote(vec![c]);
            }
            let mut backward = AwarenessRegistry::new();
            for c in changes.into_iter().rev() {
                backward.apply_remote(vec![c]);
            }

            let view = |r: &AwarenessRegistry| -> Vec<(u64, u64, Option<Vec<u8>>)> {
                let mut v: Vec<_> = r
                    .entries
                    .iter()
                    .map(|(id, e)| (*id, e.clock, e.state.clone()))
                    .collect();
                v.sort();
                v
            };
            prop_assert_eq!(view(&forward), view(&backward));
        }
    }
}

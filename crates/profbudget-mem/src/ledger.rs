//! Accounting tables for the global budget.
//!
//! Two tables with running totals:
//! - unreleased bytes per peer (absolute values, one row per live peer);
//! - released chunks of every peer in one sequence sorted by
//!   `(done_at, peer)`, so the eviction victim is always at the front.
//!
//! Totals are maintained incrementally; `debug_check` recomputes them.
//! Sizes come from other processes, so the sums are kept in `u128` and any
//! `u64` input is accepted; readers see values saturated at `u64::MAX`.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use profbudget_core::id::{PeerId, Timestamp};
use profbudget_core::update::ChunkMeta;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleasedChunk {
    pub done_at: Timestamp,
    pub size_bytes: u64,
    pub peer: PeerId,
}

impl ReleasedChunk {
    fn key(&self) -> (Timestamp, PeerId) {
        (self.done_at, self.peer)
    }
}

/// Bytes removed for one peer by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub unreleased_bytes: u64,
    pub released_bytes: u64,
    pub released_chunks: usize,
}

#[derive(Debug, Default)]
pub struct Ledger {
    unreleased_by_peer: HashMap<PeerId, u64>,
    unreleased_total: u128,
    released_by_time: VecDeque<ReleasedChunk>,
    released_total: u128,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unreleased_total(&self) -> u64 {
        saturate(self.unreleased_total)
    }

    pub fn released_total(&self) -> u64 {
        saturate(self.released_total)
    }

    pub fn total(&self) -> u64 {
        saturate(self.exact_total())
    }

    /// Bytes over `budget`, or `None` if the ledger fits.
    pub fn excess_over(&self, budget: u64) -> Option<u64> {
        let total = self.exact_total();
        let budget = u128::from(budget);
        (total > budget).then(|| saturate(total - budget))
    }

    fn exact_total(&self) -> u128 {
        self.unreleased_total + self.released_total
    }

    pub fn unreleased_of(&self, peer: PeerId) -> Option<u64> {
        self.unreleased_by_peer.get(&peer).copied()
    }

    /// True if `peer` has an unreleased row or any released chunk.
    pub fn references(&self, peer: PeerId) -> bool {
        self.unreleased_by_peer.contains_key(&peer)
            || self.released_by_time.iter().any(|c| c.peer == peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.unreleased_by_peer.keys().copied()
    }

    /// Released chunks, oldest first.
    pub fn released(&self) -> impl Iterator<Item = &ReleasedChunk> + '_ {
        self.released_by_time.iter()
    }

    pub fn released_len(&self) -> usize {
        self.released_by_time.len()
    }

    pub fn has_released(&self) -> bool {
        !self.released_by_time.is_empty()
    }

    /// Set the absolute unreleased byte count for `peer`, creating its row.
    pub fn set_unreleased(&mut self, peer: PeerId, bytes: u64) {
        let prior = self.unreleased_by_peer.insert(peer, bytes).unwrap_or(0);
        self.unreleased_total = self.unreleased_total - u128::from(prior) + u128::from(bytes);
    }

    /// Remove `peer`'s released chunks done strictly before `oldest`.
    ///
    /// Returns the bytes removed. These chunks were already destroyed by the
    /// producer itself, so nothing is evicted.
    pub fn prune_before(&mut self, peer: PeerId, oldest: Timestamp) -> u64 {
        let cut = self.released_by_time.partition_point(|c| c.done_at < oldest);
        let mut removed: u128 = 0;
        let mut i = cut;
        while i > 0 {
            i -= 1;
            if self.released_by_time[i].peer == peer {
                if let Some(c) = self.released_by_time.remove(i) {
                    removed += u128::from(c.size_bytes);
                }
            }
        }
        self.released_total -= removed;
        saturate(removed)
    }

    /// Insert a released chunk at its sorted position.
    pub fn insert_released(&mut self, peer: PeerId, chunk: ChunkMeta) {
        let entry = ReleasedChunk {
            done_at: chunk.done_at,
            size_bytes: chunk.size_bytes,
            peer,
        };
        // Equal keys keep arrival order.
        let at = self
            .released_by_time
            .partition_point(|c| c.key() <= entry.key());
        self.released_by_time.insert(at, entry);
        self.released_total += u128::from(entry.size_bytes);
    }

    /// Remove and return the globally-oldest released chunk.
    pub fn pop_oldest(&mut self) -> Option<ReleasedChunk> {
        let oldest = self.released_by_time.pop_front()?;
        self.released_total -= u128::from(oldest.size_bytes);
        Some(oldest)
    }

    /// Drop every trace of `peer`.
    pub fn purge_peer(&mut self, peer: PeerId) -> PurgeStats {
        let mut stats = PurgeStats::default();
        if let Some(bytes) = self.unreleased_by_peer.remove(&peer) {
            self.unreleased_total -= u128::from(bytes);
            stats.unreleased_bytes = bytes;
        }
        let mut released: u128 = 0;
        self.released_by_time.retain(|c| {
            if c.peer == peer {
                released += u128::from(c.size_bytes);
                stats.released_chunks += 1;
                false
            } else {
                true
            }
        });
        self.released_total -= released;
        stats.released_bytes = saturate(released);
        stats
    }

    pub fn clear(&mut self) {
        self.unreleased_by_peer.clear();
        self.unreleased_total = 0;
        self.released_by_time.clear();
        self.released_total = 0;
    }

    /// True if the released sequence is sorted by `(done_at, peer)`.
    pub fn is_sorted(&self) -> bool {
        self.released_by_time
            .iter()
            .zip(self.released_by_time.iter().skip(1))
            .all(|(a, b)| a.key() <= b.key())
    }

    /// Recompute both totals and compare against the running sums.
    #[cfg(debug_assertions)]
    pub fn debug_check(&self) {
        let released: u128 = self
            .released_by_time
            .iter()
            .map(|c| u128::from(c.size_bytes))
            .sum();
        debug_assert_eq!(self.released_total, released, "released total drifted");
        let unreleased: u128 = self.unreleased_by_peer.values().map(|&b| u128::from(b)).sum();
        debug_assert_eq!(self.unreleased_total, unreleased, "unreleased total drifted");
        debug_assert!(self.is_sorted(), "released chunks out of order");
    }

    #[cfg(not(debug_assertions))]
    pub fn debug_check(&self) {}
}

fn saturate(v: u128) -> u64 {
    u64::try_from(v).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: PeerId = PeerId::new(1);
    const B: PeerId = PeerId::new(2);

    fn chunk(ms: u64, size: u64) -> ChunkMeta {
        ChunkMeta::new(Timestamp::from_millis(ms), size)
    }

    #[test]
    fn unreleased_rows_are_absolute() {
        let mut l = Ledger::new();
        l.set_unreleased(A, 100);
        l.set_unreleased(B, 50);
        l.set_unreleased(A, 30);
        assert_eq!(l.unreleased_total(), 80);
        assert_eq!(l.unreleased_of(A), Some(30));
        l.debug_check();
    }

    #[test]
    fn equal_timestamps_order_by_peer() {
        let mut l = Ledger::new();
        l.insert_released(B, chunk(5, 1));
        l.insert_released(A, chunk(5, 2));
        l.insert_released(A, chunk(1, 3));
        let order: Vec<_> = l.released().map(|c| (c.done_at.get(), c.peer)).collect();
        assert_eq!(
            order,
            vec![(1_000_000, A), (5_000_000, A), (5_000_000, B)]
        );
        assert!(l.is_sorted());
        assert_eq!(l.released_total(), 6);
    }

    #[test]
    fn prune_only_touches_the_owner_and_older_chunks() {
        let mut l = Ledger::new();
        l.insert_released(A, chunk(1, 10));
        l.insert_released(B, chunk(2, 20));
        l.insert_released(A, chunk(3, 30));
        l.insert_released(A, chunk(5, 40));
        let removed = l.prune_before(A, Timestamp::from_millis(5));
        assert_eq!(removed, 40);
        let left: Vec<_> = l.released().map(|c| (c.peer, c.size_bytes)).collect();
        assert_eq!(left, vec![(B, 20), (A, 40)]);
        assert_eq!(l.released_total(), 60);
        l.debug_check();
    }

    #[test]
    fn pop_oldest_drains_in_time_order() {
        let mut l = Ledger::new();
        l.insert_released(B, chunk(2, 20));
        l.insert_released(A, chunk(1, 10));
        assert_eq!(l.pop_oldest().map(|c| c.peer), Some(A));
        assert_eq!(l.pop_oldest().map(|c| c.peer), Some(B));
        assert_eq!(l.pop_oldest(), None);
        assert_eq!(l.released_total(), 0);
    }

    #[test]
    fn totals_accept_any_u64_input() {
        let mut l = Ledger::new();
        l.set_unreleased(A, u64::MAX - 1);
        l.set_unreleased(B, u64::MAX - 1);
        assert_eq!(l.unreleased_total(), u64::MAX);
        assert_eq!(l.excess_over(u64::MAX), Some(u64::MAX - 2));

        let half = u64::MAX / 2 + 1;
        l.insert_released(A, chunk(1, half));
        l.insert_released(B, chunk(2, half));
        assert_eq!(l.released_total(), u64::MAX);
        l.debug_check();

        // Exact sums come back down once the large rows go away.
        l.purge_peer(A);
        assert_eq!(l.unreleased_total(), u64::MAX - 1);
        assert_eq!(l.released_total(), half);
        assert_eq!(l.pop_oldest().map(|c| c.size_bytes), Some(half));
        l.set_unreleased(B, 10);
        assert_eq!(l.total(), 10);
        assert_eq!(l.excess_over(10), None);
        assert_eq!(l.excess_over(4), Some(6));
        l.debug_check();
    }

    #[test]
    fn purge_removes_every_reference() {
        let mut l = Ledger::new();
        l.set_unreleased(A, 7);
        l.set_unreleased(B, 9);
        l.insert_released(A, chunk(1, 10));
        l.insert_released(B, chunk(2, 20));
        l.insert_released(A, chunk(3, 30));
        let stats = l.purge_peer(A);
        assert_eq!(
            stats,
            PurgeStats {
                unreleased_bytes: 7,
                released_bytes: 40,
                released_chunks: 2,
            }
        );
        assert!(!l.references(A));
        assert!(l.references(B));
        assert_eq!(l.total(), 29);
        l.debug_check();
    }
}

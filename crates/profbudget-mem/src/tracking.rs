//! Lightweight peak/eviction counters.
//!
//! Keep this cheap: plain atomics, readable from any thread while the
//! controller runs on its own sequence.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct LedgerStats {
    peak_bytes: AtomicU64,
    evicted_chunks: AtomicU64,
    evicted_bytes: AtomicU64,
    self_pruned_bytes: AtomicU64,
    over_budget_events: AtomicU64,
    protocol_violations: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub peak_bytes: u64,
    pub evicted_chunks: u64,
    pub evicted_bytes: u64,
    pub self_pruned_bytes: u64,
    pub over_budget_events: u64,
    pub protocol_violations: u64,
}

impl LedgerStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new ledger total; updates peak if higher.
    pub fn record_total(&self, total_bytes: u64) {
        let mut cur = self.peak_bytes.load(Ordering::Relaxed);
        while total_bytes > cur {
            match self.peak_bytes.compare_exchange(
                cur,
                total_bytes,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn record_eviction(&self, bytes: u64) {
        self.evicted_chunks.fetch_add(1, Ordering::Relaxed);
        self.evicted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_self_pruned(&self, bytes: u64) {
        self.self_pruned_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_over_budget(&self) {
        self.over_budget_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_violation(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn peak(&self) -> u64 {
        self.peak_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            evicted_chunks: self.evicted_chunks.load(Ordering::Relaxed),
            evicted_bytes: self.evicted_bytes.load(Ordering::Relaxed),
            self_pruned_bytes: self.self_pruned_bytes.load(Ordering::Relaxed),
            over_budget_events: self.over_budget_events.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn peak_only_moves_up() {
        let stats = LedgerStats::new();
        stats.record_total(10);
        stats.record_total(40);
        stats.record_total(20);
        assert_eq!(stats.peak(), 40);
    }

    #[test]
    fn peak_is_race_free() {
        let stats = Arc::new(LedgerStats::new());
        let handles: Vec<_> = (1..=8u64)
            .map(|i| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for j in 0..100 {
                        stats.record_total(i * 1000 + j);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("Thread panicked");
        }
        assert_eq!(stats.peak(), 8099);
    }
}

//! The global budget controller.
//!
//! `handle_update` is the only mutating entry point. A delta updates the
//! peer's unreleased row, prunes chunks the peer destroyed on its own, inserts
//! newly released chunks, then evicts oldest-first until the ledger fits the
//! budget or nothing releasable is left. A final update purges the peer.

use std::collections::HashSet;
use std::sync::Arc;

use profbudget_core::config::ControllerConfig;
use profbudget_core::id::PeerId;
use profbudget_core::update::{Delta, UpdateMessage};

use crate::diag::DiagnosticLog;
use crate::error::{Error, Result};
use crate::ledger::{Ledger, PurgeStats};
use crate::sink::Evictor;
use crate::tracking::LedgerStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The controller has lost its local producer and no longer accounts.
    Ignored,
    /// A final update removed the peer.
    Purged(PurgeStats),
    Applied {
        self_pruned_bytes: u64,
        evicted_chunks: usize,
        evicted_bytes: u64,
        /// Set when eviction ran out of released chunks while still over budget.
        unresolved: Option<Error>,
    },
}

impl UpdateOutcome {
    pub fn over_budget(&self) -> Option<&Error> {
        match self {
            UpdateOutcome::Applied { unresolved, .. } => unresolved.as_ref(),
            _ => None,
        }
    }

    pub fn evicted_chunks(&self) -> usize {
        match self {
            UpdateOutcome::Applied { evicted_chunks, .. } => *evicted_chunks,
            _ => 0,
        }
    }
}

pub struct BudgetController {
    budget_bytes: u64,
    ledger: Ledger,
    /// Peers that sent `Final`; anything further from them is a violation.
    retired: HashSet<PeerId>,
    detached: bool,
    stats: Arc<LedgerStats>,
    log: Option<DiagnosticLog>,
}

impl BudgetController {
    /// Controller with a fixed budget and an empty ledger.
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes,
            ledger: Ledger::new(),
            retired: HashSet::new(),
            detached: false,
            stats: Arc::new(LedgerStats::new()),
            log: None,
        }
    }

    /// Like [`BudgetController::new`], honouring the diagnostic log settings.
    pub fn with_config(budget_bytes: u64, cfg: &ControllerConfig) -> Self {
        let mut ctl = Self::new(budget_bytes);
        if cfg.diagnostic_log {
            let mut log = DiagnosticLog::new(cfg.diagnostic_log_capacity);
            log.controller_created();
            ctl.log = Some(log);
        }
        #[cfg(feature = "tracing")]
        tracing::info!(budget_bytes, "budget controller created");
        ctl
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn unreleased_total(&self) -> u64 {
        self.ledger.unreleased_total()
    }

    pub fn released_total(&self) -> u64 {
        self.ledger.released_total()
    }

    pub fn total_bytes(&self) -> u64 {
        self.ledger.total()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn stats(&self) -> Arc<LedgerStats> {
        Arc::clone(&self.stats)
    }

    pub fn diagnostic_log(&self) -> Option<&DiagnosticLog> {
        self.log.as_ref()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub fn has_finished(&self, peer: PeerId) -> bool {
        self.retired.contains(&peer)
    }

    /// Apply one update from `peer`.
    ///
    /// `NotAnUpdate` and anything after `Final` are protocol violations: the
    /// peer is purged as if it had sent `Final` and the error is returned for
    /// logging. Other peers' rows are never touched.
    pub fn handle_update<E>(
        &mut self,
        peer: PeerId,
        msg: UpdateMessage,
        evictor: &mut E,
    ) -> Result<UpdateOutcome>
    where
        E: Evictor + ?Sized,
    {
        if self.detached {
            #[cfg(feature = "tracing")]
            tracing::trace!(%peer, "controller detached, update ignored");
            return Ok(UpdateOutcome::Ignored);
        }

        if self.retired.contains(&peer) {
            return Err(self.violation(peer, "update after final"));
        }

        match msg {
            UpdateMessage::NotAnUpdate => Err(self.violation(peer, "non-update sent across the boundary")),
            UpdateMessage::Final => Ok(UpdateOutcome::Purged(self.retire(peer))),
            UpdateMessage::Delta(delta) => Ok(self.apply_delta(peer, delta, evictor)),
        }
    }

    /// The local producer is gone: drop all accounting and ignore further updates.
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::info!(
            dropped_bytes = self.ledger.total(),
            "local producer finished, controller detached"
        );
        self.detached = true;
        self.ledger.clear();
        self.retired.clear();
    }

    /// Start detached because there is no local producer to account for.
    pub fn detach_without_local(&mut self, reason: &str) {
        if let Some(log) = self.log.as_mut() {
            log.creation_failed(reason);
        }
        self.detach();
    }

    /// Forget that `peer` ever sent `Final` (it has disconnected for good).
    pub fn forget(&mut self, peer: PeerId) {
        self.retired.remove(&peer);
    }

    /// Carry over a `Final` that `peer` sent to an earlier controller.
    pub fn mark_finished(&mut self, peer: PeerId) {
        self.retired.insert(peer);
    }

    fn violation(&mut self, peer: PeerId, reason: &'static str) -> Error {
        self.stats.record_violation();
        #[cfg(feature = "tracing")]
        tracing::warn!(%peer, reason, "protocol violation, treating peer as finished");
        self.retire(peer);
        Error::ProtocolViolation { peer, reason }
    }

    fn retire(&mut self, peer: PeerId) -> PurgeStats {
        if let Some(log) = self.log.as_mut() {
            log.finished(peer);
        }
        self.retired.insert(peer);
        let purged = self.ledger.purge_peer(peer);
        #[cfg(feature = "tracing")]
        tracing::trace!(
            %peer,
            unreleased = purged.unreleased_bytes,
            released = purged.released_bytes,
            "peer purged"
        );
        self.ledger.debug_check();
        // Totals only went down; no eviction needed.
        purged
    }

    fn apply_delta<E>(&mut self, peer: PeerId, delta: Delta, evictor: &mut E) -> UpdateOutcome
    where
        E: Evictor + ?Sized,
    {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            %peer,
            unreleased = delta.unreleased_bytes,
            newly_released = delta.newly_released.len(),
            "update received"
        );

        self.ledger.set_unreleased(peer, delta.unreleased_bytes);

        let mut self_pruned_bytes = 0;
        if let Some(oldest) = delta.oldest_done {
            self_pruned_bytes = self.ledger.prune_before(peer, oldest);
            if self_pruned_bytes > 0 {
                self.stats.record_self_pruned(self_pruned_bytes);
                #[cfg(feature = "tracing")]
                tracing::trace!(%peer, %oldest, bytes = self_pruned_bytes, "self-pruned");
            }
        }

        for chunk in delta.newly_released {
            if let Some(log) = self.log.as_mut() {
                log.released(peer, chunk.done_at);
            }
            self.ledger.insert_released(peer, chunk);
        }

        self.ledger.debug_check();
        self.stats.record_total(self.ledger.total());

        let (evicted_chunks, evicted_bytes, unresolved) = self.enforce_budget(evictor);
        UpdateOutcome::Applied {
            self_pruned_bytes,
            evicted_chunks,
            evicted_bytes,
            unresolved,
        }
    }

    /// Evict oldest-first until the ledger fits, or report why it cannot.
    fn enforce_budget<E>(&mut self, evictor: &mut E) -> (usize, u64, Option<Error>)
    where
        E: Evictor + ?Sized,
    {
        let mut chunks = 0;
        let mut bytes: u64 = 0;
        while self.ledger.excess_over(self.budget_bytes).is_some() {
            let Some(oldest) = self.ledger.pop_oldest() else {
                break;
            };
            if let Some(log) = self.log.as_mut() {
                log.evicted(oldest.peer, oldest.done_at);
            }
            #[cfg(feature = "tracing")]
            tracing::debug!(
                owner = %oldest.peer,
                at = %oldest.done_at,
                bytes = oldest.size_bytes,
                "evicting released chunk"
            );
            self.stats.record_eviction(oldest.size_bytes);
            evictor.evict(oldest.peer, oldest.done_at);
            chunks += 1;
            bytes = bytes.saturating_add(oldest.size_bytes);
        }

        let Some(excess_bytes) = self.ledger.excess_over(self.budget_bytes) else {
            return (chunks, bytes, None);
        };

        // Only unreleased data is left; its owners must release it first.
        self.stats.record_over_budget();
        let err = Error::OverBudgetUnresolvable {
            excess_bytes,
            unreleased_bytes: self.ledger.unreleased_total(),
        };
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %err, "budget cannot be met yet");
        (chunks, bytes, Some(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Eviction;
    use profbudget_core::id::Timestamp;
    use profbudget_core::update::ChunkMeta;

    const A: PeerId = PeerId::new(1);
    const B: PeerId = PeerId::new(2);
    const C: PeerId = PeerId::new(3);

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    fn delta(unreleased: u64, oldest: Option<u64>, chunks: &[(u64, u64)]) -> UpdateMessage {
        UpdateMessage::Delta(Delta {
            unreleased_bytes: unreleased,
            released_bytes_total: 0,
            oldest_done: oldest.map(ts),
            newly_released: chunks
                .iter()
                .map(|&(ms, size)| ChunkMeta::new(ts(ms), size))
                .collect(),
        })
    }

    #[test]
    fn evicts_globally_oldest_until_under_budget() {
        let mut ctl = BudgetController::new(120);
        let mut ev: Vec<Eviction> = Vec::new();
        ctl.handle_update(A, delta(0, None, &[(1, 100)]), &mut ev).unwrap();
        assert!(ev.is_empty());
        ctl.handle_update(C, delta(0, None, &[(3, 50)]), &mut ev).unwrap();
        let outcome = ctl.handle_update(B, delta(0, None, &[(2, 50)]), &mut ev).unwrap();

        // 150 after C (over 120) evicted A; B then lands at 100.
        assert_eq!(ev, vec![Eviction { owner: A, at: ts(1) }]);
        assert_eq!(outcome.evicted_chunks(), 0);
        assert_eq!(ctl.total_bytes(), 100);
    }

    #[test]
    fn final_purges_peer_and_later_updates_are_violations() {
        let mut ctl = BudgetController::new(1_000);
        let mut ev: Vec<Eviction> = Vec::new();
        ctl.handle_update(A, delta(10, None, &[(1, 20)]), &mut ev).unwrap();
        ctl.handle_update(B, delta(5, None, &[(2, 7)]), &mut ev).unwrap();

        let outcome = ctl.handle_update(A, UpdateMessage::Final, &mut ev).unwrap();
        assert_eq!(
            outcome,
            UpdateOutcome::Purged(PurgeStats {
                unreleased_bytes: 10,
                released_bytes: 20,
                released_chunks: 1,
            })
        );
        assert!(!ctl.ledger().references(A));
        assert_eq!(ctl.total_bytes(), 12);

        let err = ctl.handle_update(A, delta(1, None, &[]), &mut ev).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { peer, .. } if peer == A));
        assert!(!ctl.ledger().references(A));
        assert_eq!(ctl.stats().snapshot().protocol_violations, 1);
    }

    #[test]
    fn not_an_update_purges_only_the_offender() {
        let mut ctl = BudgetController::new(1_000);
        let mut ev: Vec<Eviction> = Vec::new();
        ctl.handle_update(A, delta(10, None, &[(1, 20)]), &mut ev).unwrap();
        ctl.handle_update(B, delta(5, None, &[(2, 7)]), &mut ev).unwrap();

        let err = ctl
            .handle_update(B, UpdateMessage::NotAnUpdate, &mut ev)
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { peer, .. } if peer == B));
        assert!(!ctl.ledger().references(B));
        assert_eq!(ctl.ledger().unreleased_of(A), Some(10));
        assert!(ctl.has_finished(B));
    }

    #[test]
    fn unreleased_overflow_is_reported_not_fatal() {
        let mut ctl = BudgetController::new(100);
        let mut ev: Vec<Eviction> = Vec::new();
        let outcome = ctl
            .handle_update(A, delta(150, None, &[(1, 10)]), &mut ev)
            .unwrap();
        assert_eq!(ev.len(), 1);
        assert_eq!(
            outcome.over_budget(),
            Some(&Error::OverBudgetUnresolvable {
                excess_bytes: 50,
                unreleased_bytes: 150,
            })
        );
        assert!(!ctl.ledger().has_released());
        assert_eq!(ctl.stats().snapshot().over_budget_events, 1);
    }

    #[test]
    fn huge_chunks_are_evicted_without_wrapping() {
        let mut ctl = BudgetController::new(u64::MAX - 10);
        let mut ev: Vec<Eviction> = Vec::new();
        let half = u64::MAX / 2 + 1;
        ctl.handle_update(A, delta(0, None, &[(1, half)]), &mut ev).unwrap();
        let outcome = ctl
            .handle_update(B, delta(0, None, &[(2, half)]), &mut ev)
            .unwrap();
        assert_eq!(ev, vec![Eviction { owner: A, at: ts(1) }]);
        assert_eq!(outcome.evicted_chunks(), 1);
        assert_eq!(ctl.total_bytes(), half);

        let outcome = ctl
            .handle_update(C, delta(u64::MAX - 1, None, &[]), &mut ev)
            .unwrap();
        assert_eq!(ev.len(), 2);
        assert_eq!(
            outcome.over_budget(),
            Some(&Error::OverBudgetUnresolvable {
                excess_bytes: 9,
                unreleased_bytes: u64::MAX - 1,
            })
        );
    }

    #[test]
    fn marked_finished_peer_cannot_send_again() {
        let mut ctl = BudgetController::new(100);
        let mut ev: Vec<Eviction> = Vec::new();
        ctl.mark_finished(A);
        let err = ctl
            .handle_update(A, delta(0, None, &[(1, 80)]), &mut ev)
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { peer, .. } if peer == A));
        assert_eq!(ctl.total_bytes(), 0);
        assert!(ev.is_empty());
    }

    #[test]
    fn detached_controller_ignores_everything() {
        let mut ctl = BudgetController::new(100);
        let mut ev: Vec<Eviction> = Vec::new();
        ctl.handle_update(A, delta(10, None, &[(1, 10)]), &mut ev).unwrap();
        ctl.detach();
        assert_eq!(ctl.total_bytes(), 0);
        let outcome = ctl
            .handle_update(A, delta(500, None, &[(2, 500)]), &mut ev)
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Ignored);
        assert_eq!(ctl.total_bytes(), 0);
        assert!(ev.is_empty());
    }

    #[test]
    fn diagnostic_log_records_release_eviction_and_final() {
        let cfg = ControllerConfig {
            diagnostic_log: true,
            ..Default::default()
        };
        let mut ctl = BudgetController::with_config(10, &cfg);
        let mut ev: Vec<Eviction> = Vec::new();
        ctl.handle_update(A, delta(0, None, &[(1, 8), (2, 8)]), &mut ev).unwrap();
        ctl.handle_update(A, UpdateMessage::Final, &mut ev).unwrap();

        let diffs: Vec<i32> = ctl
            .diagnostic_log()
            .unwrap()
            .rows()
            .map(|r| r.2)
            .collect();
        assert_eq!(diffs, vec![1, 1, -1, 0]);
    }
}

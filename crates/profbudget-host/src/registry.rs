//! Peer tracking and controller lifecycle.
//!
//! The registry is `Idle` until sampling has started *and* at least one remote
//! peer is connected, in either order; it then creates the controller and
//! hooks the local buffer's callback into the [`LocalSlot`]. Stopping sampling
//! destroys the controller and its ledger. All methods must be called from a
//! single sequence (see [`crate::Driver`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use profbudget_core::config::ControllerConfig;
use profbudget_core::id::{PeerId, Timestamp};
use profbudget_core::update::UpdateMessage;
use profbudget_mem::controller::{BudgetController, UpdateOutcome};
use profbudget_mem::sink::{EvictionSink, Evictor};
use profbudget_mem::tracking::StatsSnapshot;

use crate::error::{Error, Result};
use crate::local::{Drained, LocalEviction, LocalSlot, LocalSource};
use crate::remote::{PeerChannel, RemoteEviction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryState {
    Idle,
    Active,
}

struct PeerEntry {
    sink: RemoteEviction,
    /// `Final` received (or synthesized after a violation).
    finished: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    pub state: RegistryState,
    pub budget_bytes: Option<u64>,
    pub unreleased_total: u64,
    pub released_total: u64,
    pub released_chunks: usize,
    pub peers: Vec<PeerId>,
    pub detached: bool,
    pub stats: Option<StatsSnapshot>,
}

pub struct PeerRegistry {
    config: ControllerConfig,
    local_id: PeerId,
    local: Option<LocalEviction>,
    slot: LocalSlot,
    peers: BTreeMap<PeerId, PeerEntry>,
    /// Budget requested by the running sampler, if any.
    sampling_budget: Option<u64>,
    controller: Option<BudgetController>,
}

/// Routes evictions by owner: the local buffer directly, remote peers by command.
struct RoutedEvictor<'a> {
    local_id: PeerId,
    local: Option<&'a LocalEviction>,
    peers: &'a BTreeMap<PeerId, PeerEntry>,
}

impl Evictor for RoutedEvictor<'_> {
    fn evict(&mut self, owner: PeerId, at: Timestamp) {
        let sink: Option<&dyn EvictionSink> = if owner == self.local_id {
            self.local.map(|l| l as &dyn EvictionSink)
        } else {
            self.peers
                .get(&owner)
                .filter(|p| !p.finished)
                .map(|p| &p.sink as &dyn EvictionSink)
        };
        match sink {
            Some(sink) => sink.destroy_at_or_before(at),
            None => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%owner, %at, "no live route for eviction");
            }
        }
    }
}

impl PeerRegistry {
    /// `local_id` is the host's own peer id; `local` its buffer, if it has one.
    pub fn new(
        local_id: PeerId,
        local: Option<Arc<dyn LocalSource>>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            config,
            local_id,
            local: local.map(LocalEviction::new),
            slot: LocalSlot::new(),
            peers: BTreeMap::new(),
            sampling_budget: None,
            controller: None,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn state(&self) -> RegistryState {
        if self.controller.is_some() {
            RegistryState::Active
        } else {
            RegistryState::Idle
        }
    }

    pub fn controller(&self) -> Option<&BudgetController> {
        self.controller.as_ref()
    }

    /// Connected peers that have not finished.
    pub fn peer_count(&self) -> usize {
        self.peers.values().filter(|p| !p.finished).count()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Run `f` on a live peer's channel.
    pub fn for_peer<R>(&self, peer: PeerId, f: impl FnOnce(&dyn PeerChannel) -> R) -> Option<R> {
        self.peers
            .get(&peer)
            .filter(|p| !p.finished)
            .map(|p| f(p.sink.channel().as_ref()))
    }

    pub fn sampling_started(&mut self, budget_bytes: u64) {
        if self.controller.is_some() {
            // The budget is fixed for the controller's lifetime.
            #[cfg(feature = "tracing")]
            tracing::debug!(budget_bytes, "sampling already active, budget unchanged");
            return;
        }
        self.sampling_budget = Some(budget_bytes);
        self.maybe_activate();
    }

    /// Start with a sampler configured in buffer entries.
    pub fn sampling_started_entries(&mut self, entries: u32) {
        let budget = self.config.budget_for_entries(entries);
        self.sampling_started(budget);
    }

    pub fn sampling_stopped(&mut self) {
        self.sampling_budget = None;
        self.deactivate();
    }

    pub fn peer_connected(&mut self, peer: PeerId, channel: Arc<dyn PeerChannel>) -> Result<()> {
        if peer == self.local_id {
            return Err(Error::LocalPeerId(peer));
        }
        if self.peers.contains_key(&peer) {
            return Err(Error::PeerAlreadyConnected(peer));
        }
        self.peers.insert(
            peer,
            PeerEntry {
                sink: RemoteEviction::new(channel),
                finished: false,
            },
        );
        #[cfg(feature = "tracing")]
        tracing::debug!(%peer, "peer connected");
        self.maybe_activate();
        Ok(())
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        let Some(entry) = self.peers.get(&peer) else {
            return;
        };
        if !entry.finished && self.controller.is_some() {
            #[cfg(feature = "tracing")]
            tracing::debug!(%peer, "peer disconnected without final update");
            if let Err(e) = self.deliver_update(peer, UpdateMessage::Final) {
                #[cfg(feature = "tracing")]
                tracing::warn!(%peer, error = %e, "synthesized final rejected");
                #[cfg(not(feature = "tracing"))]
                let _ = e;
            }
        }
        self.peers.remove(&peer);
        if let Some(ctl) = self.controller.as_mut() {
            ctl.forget(peer);
        }
    }

    /// Apply a remote peer's update, after any pending local update.
    ///
    /// Returns `Ok(None)` when there is no controller or the peer is unknown.
    /// A protocol violation purges the peer and is returned for logging.
    pub fn deliver_update(
        &mut self,
        peer: PeerId,
        msg: UpdateMessage,
    ) -> Result<Option<UpdateOutcome>> {
        let Some(ctl) = self.controller.as_mut() else {
            #[cfg(feature = "tracing")]
            tracing::trace!(%peer, "no controller, update dropped");
            return Ok(None);
        };
        if !self.peers.contains_key(&peer) {
            #[cfg(feature = "tracing")]
            tracing::debug!(%peer, "update from unknown peer dropped");
            return Ok(None);
        }

        let is_final = msg.is_final();
        let mut evictor = RoutedEvictor {
            local_id: self.local_id,
            local: self.local.as_ref(),
            peers: &self.peers,
        };
        apply_pending_local(&self.slot, self.local_id, ctl, &mut evictor);
        let result = ctl.handle_update(peer, msg, &mut evictor);

        if is_final || result.is_err() {
            if let Some(entry) = self.peers.get_mut(&peer) {
                entry.finished = true;
            }
        }
        Ok(Some(result?))
    }

    /// Apply the pending local update now, if any.
    pub fn flush_local(&mut self) {
        if let Some(ctl) = self.controller.as_mut() {
            let mut evictor = RoutedEvictor {
                local_id: self.local_id,
                local: self.local.as_ref(),
                peers: &self.peers,
            };
            apply_pending_local(&self.slot, self.local_id, ctl, &mut evictor);
        }
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let ctl = self.controller.as_ref();
        RegistrySnapshot {
            state: self.state(),
            budget_bytes: ctl.map(|c| c.budget_bytes()),
            unreleased_total: ctl.map_or(0, |c| c.unreleased_total()),
            released_total: ctl.map_or(0, |c| c.released_total()),
            released_chunks: ctl.map_or(0, |c| c.ledger().released_len()),
            peers: self
                .peers
                .iter()
                .filter(|(_, p)| !p.finished)
                .map(|(id, _)| *id)
                .collect(),
            detached: ctl.is_some_and(|c| c.is_detached()),
            stats: ctl.map(|c| c.stats().snapshot()),
        }
    }

    /// Host teardown: destroy the controller and forget all peers.
    pub fn shutdown(&mut self) {
        self.sampling_budget = None;
        self.deactivate();
        self.peers.clear();
    }

    fn maybe_activate(&mut self) {
        if self.controller.is_some() || self.peers.is_empty() {
            return;
        }
        let Some(budget) = self.sampling_budget else {
            return;
        };

        let mut ctl = BudgetController::with_config(budget, &self.config);
        match &self.local {
            Some(local) => {
                self.slot.attach();
                local.source().set_update_callback(Some(self.slot.callback()));
            }
            None => ctl.detach_without_local("No local buffer manager"),
        }
        // A peer that sent Final stays finished across sampling sessions.
        for (&peer, _) in self.peers.iter().filter(|(_, p)| p.finished) {
            ctl.mark_finished(peer);
        }
        #[cfg(feature = "tracing")]
        tracing::info!(budget_bytes = budget, peers = self.peers.len(), "registry active");
        self.controller = Some(ctl);
    }

    fn deactivate(&mut self) {
        let Some(mut ctl) = self.controller.take() else {
            return;
        };
        {
            let mut evictor = RoutedEvictor {
                local_id: self.local_id,
                local: self.local.as_ref(),
                peers: &self.peers,
            };
            apply_pending_local(&self.slot, self.local_id, &mut ctl, &mut evictor);
        }
        if self.slot.detach() {
            if let Some(local) = &self.local {
                local.source().set_update_callback(None);
            }
        }
        #[cfg(feature = "tracing")]
        tracing::info!(
            dropped_bytes = ctl.total_bytes(),
            "registry idle, controller destroyed"
        );
        drop(ctl);
    }
}

impl Drop for PeerRegistry {
    fn drop(&mut self) {
        self.deactivate();
    }
}

fn apply_pending_local(
    slot: &LocalSlot,
    local_id: PeerId,
    ctl: &mut BudgetController,
    evictor: &mut RoutedEvictor<'_>,
) {
    match slot.drain() {
        Drained::Nothing => {}
        Drained::Lost => ctl.detach(),
        Drained::Update(update) => {
            if let Err(e) = ctl.handle_update(local_id, update, evictor) {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "pending local update rejected");
                #[cfg(not(feature = "tracing"))]
                let _ = e;
            }
        }
    }
}

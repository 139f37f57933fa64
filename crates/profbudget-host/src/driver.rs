//! The single sequence that owns the registry.
//!
//! Every lifecycle input and every remote update is marshaled onto one tokio
//! task through an unbounded queue, so the ledger is never touched in
//! parallel. Each connected peer gets a pump task that long-polls its channel
//! and posts results back; a failed poll counts as the peer's final update.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use profbudget_core::id::PeerId;
use profbudget_core::update::UpdateMessage;

use crate::error::{Error, Result};
use crate::registry::{PeerRegistry, RegistrySnapshot};
use crate::remote::PeerChannel;

pub enum HostEvent {
    SamplingStarted { budget_bytes: u64 },
    SamplingStartedEntries { entries: u32 },
    SamplingStopped,
    PeerConnected {
        peer: PeerId,
        channel: Arc<dyn PeerChannel>,
    },
    PeerDisconnected { peer: PeerId },
    Update { peer: PeerId, msg: UpdateMessage },
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    Shutdown(oneshot::Sender<PeerRegistry>),
}

/// Cloneable handle for feeding the driver.
#[derive(Clone)]
pub struct Host {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl Host {
    fn send(&self, ev: HostEvent) -> Result<()> {
        self.tx.send(ev).map_err(|_| Error::DriverGone)
    }

    pub fn sampling_started(&self, budget_bytes: u64) -> Result<()> {
        self.send(HostEvent::SamplingStarted { budget_bytes })
    }

    pub fn sampling_started_entries(&self, entries: u32) -> Result<()> {
        self.send(HostEvent::SamplingStartedEntries { entries })
    }

    pub fn sampling_stopped(&self) -> Result<()> {
        self.send(HostEvent::SamplingStopped)
    }

    pub fn peer_connected(&self, peer: PeerId, channel: Arc<dyn PeerChannel>) -> Result<()> {
        self.send(HostEvent::PeerConnected { peer, channel })
    }

    pub fn peer_disconnected(&self, peer: PeerId) -> Result<()> {
        self.send(HostEvent::PeerDisconnected { peer })
    }

    /// Inject an update as if it came from `peer`'s channel.
    pub fn deliver(&self, peer: PeerId, msg: UpdateMessage) -> Result<()> {
        self.send(HostEvent::Update { peer, msg })
    }

    pub async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(HostEvent::Snapshot(tx))?;
        rx.await.map_err(|_| Error::DriverGone)
    }

    /// Stop the driver and get the registry back.
    pub async fn shutdown(&self) -> Result<PeerRegistry> {
        let (tx, rx) = oneshot::channel();
        self.send(HostEvent::Shutdown(tx))?;
        rx.await.map_err(|_| Error::DriverGone)
    }
}

pub struct Driver {
    registry: PeerRegistry,
    rx: mpsc::UnboundedReceiver<HostEvent>,
    /// Weak so the queue closes once every `Host` and pump is gone.
    tx: mpsc::WeakUnboundedSender<HostEvent>,
    pumps: HashMap<PeerId, JoinHandle<()>>,
}

impl Driver {
    /// Spawn the driver on the current tokio runtime.
    pub fn spawn(registry: PeerRegistry) -> Host {
        let (tx, rx) = mpsc::unbounded_channel();
        let driver = Driver {
            registry,
            rx,
            tx: tx.downgrade(),
            pumps: HashMap::new(),
        };
        tokio::spawn(driver.run());
        Host { tx }
    }

    async fn run(mut self) {
        let mut reply_to = None;
        while let Some(ev) = self.rx.recv().await {
            match ev {
                HostEvent::SamplingStarted { budget_bytes } => {
                    self.registry.sampling_started(budget_bytes)
                }
                HostEvent::SamplingStartedEntries { entries } => {
                    self.registry.sampling_started_entries(entries)
                }
                HostEvent::SamplingStopped => self.registry.sampling_stopped(),
                HostEvent::PeerConnected { peer, channel } => self.on_connected(peer, channel),
                HostEvent::PeerDisconnected { peer } => {
                    if let Some(pump) = self.pumps.remove(&peer) {
                        pump.abort();
                    }
                    self.registry.peer_disconnected(peer);
                }
                HostEvent::Update { peer, msg } => {
                    if let Err(e) = self.registry.deliver_update(peer, msg) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%peer, error = %e, "update rejected");
                        #[cfg(not(feature = "tracing"))]
                        let _ = e;
                    }
                }
                HostEvent::Snapshot(reply) => {
                    let _ = reply.send(self.registry.snapshot());
                }
                HostEvent::Shutdown(reply) => {
                    reply_to = Some(reply);
                    break;
                }
            }
        }

        self.stop_pumps();
        self.registry.shutdown();
        if let Some(reply) = reply_to {
            let _ = reply.send(self.registry);
        }
    }

    fn on_connected(&mut self, peer: PeerId, channel: Arc<dyn PeerChannel>) {
        if let Err(e) = self.registry.peer_connected(peer, Arc::clone(&channel)) {
            #[cfg(feature = "tracing")]
            tracing::warn!(%peer, error = %e, "connection refused");
            #[cfg(not(feature = "tracing"))]
            let _ = e;
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.pumps
            .insert(peer, tokio::spawn(pump_updates(peer, channel, tx)));
    }

    fn stop_pumps(&mut self) {
        for (_, pump) in self.pumps.drain() {
            pump.abort();
        }
    }
}

/// Long-poll one peer until it finishes, fails, or the driver goes away.
async fn pump_updates(
    peer: PeerId,
    channel: Arc<dyn PeerChannel>,
    tx: mpsc::UnboundedSender<HostEvent>,
) {
    loop {
        let msg = match channel.await_next_update().await {
            Ok(msg) => msg,
            Err(e) => {
                // TODO: tell a rejected request apart from a clean shutdown once
                // channels report disconnect reasons; both end the peer today.
                #[cfg(feature = "tracing")]
                tracing::debug!(%peer, error = %e, "update request failed, treating as final");
                #[cfg(not(feature = "tracing"))]
                let _ = e;
                UpdateMessage::Final
            }
        };
        let last = msg.is_final() || msg.is_not_update();
        if tx.send(HostEvent::Update { peer, msg }).is_err() || last {
            return;
        }
    }
}

//! Channel to a remote peer.
//!
//! The contract is a long-poll request (`await_next_update`, resolved when the
//! peer next has something to report) plus a fire-and-forget eviction
//! command. Updates from one peer must be delivered in the order produced.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use profbudget_core::id::Timestamp;
use profbudget_core::update::UpdateMessage;
use profbudget_core::wire::PeerCommand;
use profbudget_mem::sink::EvictionSink;

use crate::error::ChannelError;

pub type UpdateFuture =
    Pin<Box<dyn Future<Output = Result<UpdateMessage, ChannelError>> + Send + 'static>>;

pub trait PeerChannel: Send + Sync + 'static {
    /// Resolve with the peer's next update. An error means the peer is gone.
    fn await_next_update(&self) -> UpdateFuture;

    /// Ask the peer to destroy released chunks done at or before `at`.
    fn destroy_at_or_before(&self, at: Timestamp);
}

/// Eviction of a remote peer's chunks: a one-way command on its channel.
#[derive(Clone)]
pub struct RemoteEviction {
    channel: Arc<dyn PeerChannel>,
}

impl RemoteEviction {
    pub fn new(channel: Arc<dyn PeerChannel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<dyn PeerChannel> {
        &self.channel
    }
}

impl EvictionSink for RemoteEviction {
    fn destroy_at_or_before(&self, at: Timestamp) {
        self.channel.destroy_at_or_before(at);
    }
}

/// Host side of an in-process peer channel.
pub struct InProcessChannel {
    updates: Arc<Mutex<mpsc::UnboundedReceiver<UpdateMessage>>>,
    commands: mpsc::UnboundedSender<PeerCommand>,
}

/// Peer side of an in-process channel: push updates, receive commands.
pub struct PeerEndpoint {
    updates: mpsc::UnboundedSender<UpdateMessage>,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
}

/// Create a connected channel pair. Dropping the endpoint closes the channel.
pub fn in_process_channel() -> (InProcessChannel, PeerEndpoint) {
    let (updates_tx, updates_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    (
        InProcessChannel {
            updates: Arc::new(Mutex::new(updates_rx)),
            commands: commands_tx,
        },
        PeerEndpoint {
            updates: updates_tx,
            commands: commands_rx,
        },
    )
}

impl PeerChannel for InProcessChannel {
    fn await_next_update(&self) -> UpdateFuture {
        let updates = Arc::clone(&self.updates);
        Box::pin(async move {
            let mut rx = updates.lock().await;
            rx.recv().await.ok_or(ChannelError::Closed)
        })
    }

    fn destroy_at_or_before(&self, at: Timestamp) {
        // Fire-and-forget: a gone peer has nothing left to destroy.
        if self
            .commands
            .send(PeerCommand::DestroyAtOrBefore { at })
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::trace!(%at, "destroy command dropped, peer endpoint closed");
        }
    }
}

impl PeerEndpoint {
    /// Report an update to the host.
    pub fn send(&self, update: UpdateMessage) -> Result<(), ChannelError> {
        self.updates.send(update).map_err(|_| ChannelError::Closed)
    }

    /// Next command, waiting for one. `None` once the host side is gone.
    pub async fn recv_command(&mut self) -> Option<PeerCommand> {
        self.commands.recv().await
    }

    /// All commands received so far, without waiting.
    pub fn drain_commands(&mut self) -> Vec<PeerCommand> {
        let mut out = Vec::new();
        while let Ok(cmd) = self.commands.try_recv() {
            out.push(cmd);
        }
        out
    }
}

use profbudget_core::id::PeerId;
use thiserror::Error;

/// Result type local to profbudget-host.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is already connected")]
    PeerAlreadyConnected(PeerId),

    #[error("{0} is the local peer id and cannot connect as a remote peer")]
    LocalPeerId(PeerId),

    #[error(transparent)]
    Budget(#[from] profbudget_mem::error::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("host driver is no longer running")]
    DriverGone,
}

/// Failure of the channel to a remote peer.
///
/// Any of these ends the peer's update stream as if it had sent `Final`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("request rejected: {0}")]
    Rejected(String),
}

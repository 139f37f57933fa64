use profbudget_core::id::PeerId;
use thiserror::Error;

/// Result type local to profbudget-mem.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The peer broke the update protocol; it has been purged as if it sent `Final`.
    #[error("protocol violation by {peer}: {reason}")]
    ProtocolViolation { peer: PeerId, reason: &'static str },

    /// Every released chunk is gone and the ledger is still over budget.
    #[error(
        "over budget by {excess_bytes} bytes with nothing left to evict ({unreleased_bytes} bytes unreleased)"
    )]
    OverBudgetUnresolvable {
        excess_bytes: u64,
        unreleased_bytes: u64,
    },
}

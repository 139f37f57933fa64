//! Eviction interfaces.
//!
//! An [`EvictionSink`] destroys one peer's released data; how depends on the
//! peer (direct call for the local buffer, one-way command for a remote one).
//! The controller only sees an [`Evictor`], which routes by owner.

use serde::Serialize;

use profbudget_core::id::{PeerId, Timestamp};

/// Destroy released chunks of a single peer.
///
/// Must be idempotent: destroying already-destroyed data is a no-op.
/// Best-effort and fire-and-forget; failures are not reported back.
pub trait EvictionSink: Send + Sync {
    fn destroy_at_or_before(&self, at: Timestamp);
}

/// Routes an eviction decision to the sink of the owning peer.
pub trait Evictor {
    fn evict(&mut self, owner: PeerId, at: Timestamp);
}

/// One eviction decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Eviction {
    pub owner: PeerId,
    pub at: Timestamp,
}

/// Recording evictor for tests and replays.
impl Evictor for Vec<Eviction> {
    fn evict(&mut self, owner: PeerId, at: Timestamp) {
        self.push(Eviction { owner, at });
    }
}

impl<F> Evictor for F
where
    F: FnMut(PeerId, Timestamp),
{
    fn evict(&mut self, owner: PeerId, at: Timestamp) {
        self(owner, at)
    }
}

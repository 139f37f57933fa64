//! Convenient re-exports for downstream crates.

pub use crate::config::ControllerConfig;
pub use crate::error::{Error, Result};
pub use crate::id::{PeerId, Timestamp};
pub use crate::update::{ChunkMeta, Delta, UpdateMessage};
pub use crate::wire::{PeerCommand, WireUpdate};

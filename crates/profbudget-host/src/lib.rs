#![forbid(unsafe_code)]
//! profbudget-host: owns the budget controller inside the host process.
//!
//! - [`PeerRegistry`] decides when a controller exists (sampling active and at
//!   least one peer connected) and routes updates and evictions.
//! - [`LocalSlot`] is the only lock: the host's own buffer reports through a
//!   callback that may run under foreign locks, so its updates are folded into
//!   the slot and applied later from the driver.
//! - [`Driver`] is the single sequence that touches the registry; remote peers
//!   are long-polled by pump tasks that post back into it.

pub mod driver;
pub mod error;
pub mod local;
pub mod registry;
pub mod remote;

pub use driver::{Driver, Host, HostEvent};
pub use error::{ChannelError, Error, Result};
pub use local::{LocalEviction, LocalSlot, LocalSource, RecordingLocalSource, UpdateCallback};
pub use registry::{PeerRegistry, RegistrySnapshot, RegistryState};
pub use remote::{in_process_channel, InProcessChannel, PeerChannel, PeerEndpoint, RemoteEviction};

#![forbid(unsafe_code)]
//! profbudget-mem: global byte budget across profile producers.
//!
//! The [`BudgetController`] keeps one ledger for every peer: unreleased bytes
//! per peer and a single time-ordered list of released chunks. When the sum
//! goes over budget it evicts the globally-oldest released chunk first,
//! whichever peer owns it, through an [`Evictor`].
//!
//! Nothing here locks or blocks. The controller must be driven from a single
//! sequence; `profbudget-host` provides that sequence.

pub mod controller;
pub mod diag;
pub mod error;
pub mod ledger;
pub mod sink;
pub mod tracking;

pub use controller::{BudgetController, UpdateOutcome};
pub use diag::DiagnosticLog;
pub use ledger::{Ledger, ReleasedChunk};
pub use sink::{Eviction, EvictionSink, Evictor};
pub use tracking::{LedgerStats, StatsSnapshot};

#![forbid(unsafe_code)]
//! profbudget: global memory-budget control for multi-process profile buffers.
//!
//! Facade over the workspace crates; benches and downstream users can depend
//! on this single package.

pub use profbudget_core as model;
pub use profbudget_host as host;
pub use profbudget_mem as mem;

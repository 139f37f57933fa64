#![forbid(unsafe_code)]
//! profbudget-core: shared vocabulary for the profile-buffer budget controller.
//!
//! Everything here is plain data: peer ids and timestamps, the update messages
//! producers send about their buffers, the wire form of those messages, and the
//! controller configuration. No locking, async, or IO lives in this crate.

pub mod config;
pub mod error;
pub mod id;
pub mod prelude;
pub mod update;
pub mod wire;

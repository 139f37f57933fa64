//! Buffer-state updates sent by profile producers.
//!
//! Every producer (the host process and each remote peer) reports its buffer
//! as a stream of [`UpdateMessage`]s. The peer an update belongs to is carried
//! by whoever routes it (channel, callback registration), not by the message.

use serde::{Deserialize, Serialize};

use crate::id::Timestamp;

/// One chunk that became immutable and reclaimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub done_at: Timestamp,
    pub size_bytes: u64,
}

impl ChunkMeta {
    pub const fn new(done_at: Timestamp, size_bytes: u64) -> Self {
        Self {
            done_at,
            size_bytes,
        }
    }
}

/// Point-in-time buffer snapshot plus the chunks released since the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Bytes still being written. Absolute: replaces the previous value.
    pub unreleased_bytes: u64,
    /// Producer-side total of released bytes (informational).
    pub released_bytes_total: u64,
    /// Released chunks older than this have already been destroyed locally.
    pub oldest_done: Option<Timestamp>,
    /// Additive: chunks released since the previous update.
    pub newly_released: Vec<ChunkMeta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum UpdateMessage {
    /// Nothing happened. Never stored, never sent across a boundary.
    #[default]
    NotAnUpdate,
    /// The producer will not send anything else.
    Final,
    Delta(Delta),
}

impl UpdateMessage {
    pub fn is_not_update(&self) -> bool {
        matches!(self, UpdateMessage::NotAnUpdate)
    }

    pub fn is_final(&self) -> bool {
        matches!(self, UpdateMessage::Final)
    }

    /// Reset to `NotAnUpdate`.
    pub fn clear(&mut self) {
        *self = UpdateMessage::NotAnUpdate;
    }

    /// Take the current value, leaving `NotAnUpdate` behind.
    pub fn take(&mut self) -> UpdateMessage {
        std::mem::take(self)
    }

    /// Merge a newer update from the same producer into this one.
    ///
    /// The result describes the same ledger change as applying both in order:
    /// absolute fields come from `newer`, released chunks concatenate, and a
    /// `Final` on either side wins.
    pub fn fold(&mut self, newer: UpdateMessage) {
        match newer {
            UpdateMessage::NotAnUpdate => {}
            UpdateMessage::Final => *self = UpdateMessage::Final,
            UpdateMessage::Delta(newer) => match self {
                UpdateMessage::Final => {}
                UpdateMessage::NotAnUpdate => *self = UpdateMessage::Delta(newer),
                UpdateMessage::Delta(pending) => pending.fold(newer),
            },
        }
    }
}

impl Delta {
    fn fold(&mut self, newer: Delta) {
        self.unreleased_bytes = newer.unreleased_bytes;
        self.released_bytes_total = newer.released_bytes_total;
        if let Some(oldest) = newer.oldest_done {
            self.oldest_done = Some(oldest);
            // Pending chunks the producer already destroyed would be pruned on
            // apply anyway.
            self.newly_released.retain(|c| c.done_at >= oldest);
        }
        self.newly_released.extend(newer.newly_released);
    }

    /// Sum of `newly_released` sizes.
    pub fn newly_released_bytes(&self) -> u64 {
        self.newly_released.iter().map(|c| c.size_bytes).sum()
    }
}

impl From<Delta> for UpdateMessage {
    fn from(d: Delta) -> Self {
        UpdateMessage::Delta(d)
    }
}

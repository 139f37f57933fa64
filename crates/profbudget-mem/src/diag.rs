//! Structured diagnostic log of accounting events.
//!
//! Not needed for correctness. Each row is `[peer, chunk_done_ms, diff]`:
//! `+1` per newly released chunk, `-1` per eviction, `0` for a final update
//! (with a null timestamp). The JSON shape matches what profile viewers
//! already read for the buffer controller.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::Value;

use profbudget_core::id::{PeerId, Timestamp};

const UPDATES_SCHEMA: &str = "0: pid, 1: chunkRelease_TSms, 2: chunkDiff";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LogRow(pub u64, pub Option<f64>, pub i32);

#[derive(Debug, Serialize)]
pub struct DiagnosticLog {
    #[serde(rename = "logBegin_TSms")]
    log_begin_ms: f64,
    #[serde(
        rename = "controllerCreationTime_TSms",
        skip_serializing_if = "Option::is_none"
    )]
    controller_creation_ms: Option<f64>,
    #[serde(
        rename = "controllerCreationFailureReason",
        skip_serializing_if = "Option::is_none"
    )]
    creation_failure: Option<String>,
    #[serde(rename = "updatesSchema")]
    updates_schema: &'static str,
    updates: VecDeque<LogRow>,
    #[serde(rename = "droppedRows")]
    dropped_rows: u64,
    #[serde(skip)]
    capacity: usize,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            log_begin_ms: now_millis(),
            controller_creation_ms: None,
            creation_failure: None,
            updates_schema: UPDATES_SCHEMA,
            updates: VecDeque::new(),
            dropped_rows: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn controller_created(&mut self) {
        self.controller_creation_ms = Some(now_millis());
    }

    pub fn creation_failed(&mut self, reason: impl Into<String>) {
        self.creation_failure = Some(reason.into());
    }

    pub fn released(&mut self, peer: PeerId, at: Timestamp) {
        self.push(LogRow(peer.get(), Some(at.as_millis_f64()), 1));
    }

    pub fn evicted(&mut self, peer: PeerId, at: Timestamp) {
        self.push(LogRow(peer.get(), Some(at.as_millis_f64()), -1));
    }

    pub fn finished(&mut self, peer: PeerId) {
        self.push(LogRow(peer.get(), None, 0));
    }

    pub fn rows(&self) -> impl Iterator<Item = &LogRow> + '_ {
        self.updates.iter()
    }

    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows
    }

    pub fn to_json(&self) -> Value {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    fn push(&mut self, row: LogRow) {
        if self.updates.len() >= self.capacity {
            self.updates.pop_front();
            self.dropped_rows += 1;
        }
        self.updates.push_back(row);
    }
}

fn now_millis() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
        * 1000.0
}

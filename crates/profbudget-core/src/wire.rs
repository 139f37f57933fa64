//! Wire form of updates and eviction commands.
//!
//! Remote peers serialize their updates as a flat record. A final update is
//! signalled in-band by an impossible `unreleased_bytes` value, so the record
//! has no variant tag. `NotAnUpdate` never crosses a process boundary.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::Timestamp;
use crate::update::{ChunkMeta, Delta, UpdateMessage};

/// `unreleased_bytes` value that marks a final update.
pub const FINAL_UNRELEASED_BYTES: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUpdate {
    pub unreleased_bytes: u64,
    pub released_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oldest_done_timestamp: Option<Timestamp>,
    #[serde(default)]
    pub newly_released_chunks: Vec<ChunkMeta>,
}

impl WireUpdate {
    pub fn final_update() -> Self {
        Self {
            unreleased_bytes: FINAL_UNRELEASED_BYTES,
            released_bytes: 0,
            oldest_done_timestamp: None,
            newly_released_chunks: Vec::new(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.unreleased_bytes == FINAL_UNRELEASED_BYTES
    }
}

impl TryFrom<UpdateMessage> for WireUpdate {
    type Error = Error;

    fn try_from(msg: UpdateMessage) -> Result<Self> {
        match msg {
            UpdateMessage::NotAnUpdate => Err(Error::NotAnUpdateOnWire),
            UpdateMessage::Final => Ok(WireUpdate::final_update()),
            UpdateMessage::Delta(d) => Ok(WireUpdate {
                unreleased_bytes: d.unreleased_bytes,
                released_bytes: d.released_bytes_total,
                oldest_done_timestamp: d.oldest_done,
                newly_released_chunks: d.newly_released,
            }),
        }
    }
}

impl From<WireUpdate> for UpdateMessage {
    fn from(w: WireUpdate) -> Self {
        if w.is_final() {
            return UpdateMessage::Final;
        }
        UpdateMessage::Delta(Delta {
            unreleased_bytes: w.unreleased_bytes,
            released_bytes_total: w.released_bytes,
            oldest_done: w.oldest_done_timestamp,
            newly_released: w.newly_released_chunks,
        })
    }
}

/// One-way command from the controller host to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum PeerCommand {
    /// Destroy every released chunk done at or before `at`. Idempotent.
    DestroyAtOrBefore { at: Timestamp },
}

/// Encode an update as a single JSON line (no trailing newline).
pub fn encode_line(msg: UpdateMessage) -> Result<String> {
    let wire = WireUpdate::try_from(msg)?;
    Ok(serde_json::to_string(&wire)?)
}

/// Decode one JSON line produced by [`encode_line`].
pub fn decode_line(line: &str) -> Result<UpdateMessage> {
    let wire: WireUpdate = serde_json::from_str(line.trim())?;
    Ok(wire.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_is_encoded_in_band() {
        let line = encode_line(UpdateMessage::Final).unwrap();
        assert!(line.contains(&u64::MAX.to_string()));
        assert!(decode_line(&line).unwrap().is_final());
    }

    #[test]
    fn not_an_update_has_no_wire_form() {
        assert!(matches!(
            encode_line(UpdateMessage::NotAnUpdate),
            Err(Error::NotAnUpdateOnWire)
        ));
    }

    #[test]
    fn delta_survives_the_wire() {
        let msg = UpdateMessage::Delta(Delta {
            unreleased_bytes: 64,
            released_bytes_total: 300,
            oldest_done: Some(Timestamp::from_millis(5)),
            newly_released: vec![ChunkMeta::new(Timestamp::from_millis(9), 300)],
        });
        let line = encode_line(msg.clone()).unwrap();
        assert_eq!(decode_line(&line).unwrap(), msg);
    }

    #[test]
    fn missing_optional_fields_decode_as_empty() {
        let msg = decode_line(r#"{"unreleased_bytes":7,"released_bytes":0}"#).unwrap();
        assert_eq!(
            msg,
            UpdateMessage::Delta(Delta {
                unreleased_bytes: 7,
                ..Default::default()
            })
        );
        assert!(matches!(decode_line("{"), Err(Error::Decode(_))));
    }

    #[test]
    fn command_is_tagged() {
        let cmd = PeerCommand::DestroyAtOrBefore {
            at: Timestamp::new(10),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"cmd":"destroy_at_or_before","at":10}"#);
    }
}

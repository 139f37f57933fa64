//! Strongly-typed identifiers and clock values used across the controller.
//!
//! Downstream crates should *not* pass raw integers for peers or times.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }
    };
}

new_id!(PeerId);
new_id!(Timestamp);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer({})", self.0)
    }
}

/// A point on the monotonic clock shared by every peer, in nanoseconds.
///
/// All producers stamp chunk completion on the same clock domain, so values
/// from different peers compare meaningfully.
impl Timestamp {
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms.saturating_mul(1_000_000))
    }

    /// Fractional milliseconds, the unit of the diagnostic log.
    pub fn as_millis_f64(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_across_peers() {
        let a = Timestamp::from_millis(2);
        let b = Timestamp::new(2_000_001);
        assert!(a < b);
        assert_eq!(a.to_string(), "2.000ms");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&PeerId::new(42)).unwrap();
        assert_eq!(json, "42");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, PeerId::new(42));
        assert_eq!(back.to_string(), "peer(42)");
    }
}

//! Time-bounded lease used to keep reconciliation cycles from overlapping.

use serde::{Deserialize, Serialize};

/// A named lease held by one process until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl Lease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Whether `holder` may take this lease at `now`.
    pub fn available_to(&self, holder: &str, now: u64) -> bool {
        self.holder == holder || self.is_expired(now)
    }
}

//! Record types owned by the state store.
//!
//! Workers, jobs and allocations come from `hoist-core`; the types here
//! are the store's own bookkeeping.

use serde::{Deserialize, Serialize};

pub use hoist_core::types::{Allocation, Job, Worker};

/// Counter bumped once per deploy run.
pub const UPDATE_SEQUENCE: &str = "update_sequence";

/// Two-generation fingerprint for one guarded entity.
///
/// `previous_hash == None` means the entity was never successfully applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashRecord {
    pub namespace: String,
    pub key: String,
    pub current_hash: String,
    pub previous_hash: Option<String>,
}

impl HashRecord {
    /// Whether the guarded entity needs (re)application.
    pub fn is_changed(&self) -> bool {
        self.previous_hash.as_deref() != Some(self.current_hash.as_str())
    }

    /// Never successfully applied.
    pub fn is_new(&self) -> bool {
        self.previous_hash.is_none()
    }
}

/// A versioned key-value entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KvEntry {
    pub value: String,
    /// Starts at 1, bumped on every put.
    pub version: u64,
    /// Unix timestamp (seconds) of the last put.
    pub updated_at: u64,
}

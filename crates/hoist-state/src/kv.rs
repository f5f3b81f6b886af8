//! Versioned key-value store.
//!
//! Namespaced string values used as template inputs. Every put bumps the
//! entry's version; deletes drop the entry entirely.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::StateResult;
use crate::store::{StateRead, Txn};
use crate::tables;
use crate::types::KvEntry;

impl Txn {
    /// Insert or overwrite a value and return the stored entry.
    pub fn kv_put(&mut self, namespace: &str, key: &str, value: &str) -> StateResult<KvEntry> {
        let version = self
            .kv_get(namespace, key)?
            .map_or(1, |existing| existing.version + 1);
        let entry = KvEntry {
            value: value.to_string(),
            version,
            updated_at: epoch_secs(),
        };
        self.put_json(tables::KV, &tables::composite_key(namespace, key), &entry)?;
        debug!(%namespace, %key, version, "kv entry stored");
        Ok(entry)
    }

    /// Delete a value. Returns true if it existed.
    pub fn kv_delete(&mut self, namespace: &str, key: &str) -> StateResult<bool> {
        self.remove_key(tables::KV, &tables::composite_key(namespace, key))
    }
}

/// Current Unix epoch in seconds.
fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

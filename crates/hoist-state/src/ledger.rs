//! Change-detection ledger.
//!
//! A two-generation fingerprint store keyed by `(namespace, key)`. The
//! rollout engine records the content hash of what it is about to apply
//! with [`Txn::update_hash`] and only after the side effect completed
//! without error calls [`Txn::promote_hash`]. A crash in between leaves the
//! record changed, so the next run reapplies: delivery is at-least-once and
//! every guarded operation must be idempotent.
//!
//! Reads (`hash_record`, `hash_changed`, `previous_hash`) live on
//! [`StateRead`](crate::StateRead).

use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::store::{StateRead, Txn};
use crate::tables;
use crate::types::HashRecord;

impl Txn {
    /// Upsert the current hash. A fresh record starts with no previous hash.
    pub fn update_hash(&mut self, namespace: &str, key: &str, hash: &str) -> StateResult<HashRecord> {
        let record = match self.hash_record(namespace, key)? {
            Some(mut record) => {
                record.current_hash = hash.to_string();
                record
            }
            None => HashRecord {
                namespace: namespace.to_string(),
                key: key.to_string(),
                current_hash: hash.to_string(),
                previous_hash: None,
            },
        };
        self.put_json(tables::LEDGER, &tables::composite_key(namespace, key), &record)?;
        debug!(%namespace, %key, changed = record.is_changed(), "hash updated");
        Ok(record)
    }

    /// Copy the current hash into the previous slot. Returns whether the
    /// record changed; promoting an already-promoted record writes nothing.
    pub fn promote_hash(&mut self, namespace: &str, key: &str) -> StateResult<bool> {
        let mut record = self
            .hash_record(namespace, key)?
            .ok_or_else(|| StateError::MissingHashRecord {
                namespace: namespace.to_string(),
                key: key.to_string(),
            })?;
        if !record.is_changed() {
            return Ok(false);
        }
        record.previous_hash = Some(record.current_hash.clone());
        self.put_json(tables::LEDGER, &tables::composite_key(namespace, key), &record)?;
        debug!(%namespace, %key, "hash promoted");
        Ok(true)
    }

    /// Forget the applied generation so the entity is treated as new.
    /// Returns whether the record changed.
    pub fn reset_hash(&mut self, namespace: &str, key: &str) -> StateResult<bool> {
        let Some(mut record) = self.hash_record(namespace, key)? else {
            return Ok(false);
        };
        if record.previous_hash.is_none() {
            return Ok(false);
        }
        record.previous_hash = None;
        self.put_json(tables::LEDGER, &tables::composite_key(namespace, key), &record)?;
        debug!(%namespace, %key, "hash reset");
        Ok(true)
    }

    /// Delete a record. Returns true if it existed.
    pub fn remove_hash(&mut self, namespace: &str, key: &str) -> StateResult<bool> {
        self.remove_key(tables::LEDGER, &tables::composite_key(namespace, key))
    }
}

#[cfg(test)]
mod tests {
    use crate::{StateError, StateRead, StateStore};

    const NS: &str = "web_allocation";

    #[test]
    fn absent_record_counts_as_changed() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.hash_changed(NS, "a1").unwrap());
        assert_eq!(store.previous_hash(NS, "a1").unwrap(), "");
    }

    #[test]
    fn promotion_law() {
        let store = StateStore::open_in_memory().unwrap();

        let record = store.write(|tx| tx.update_hash(NS, "a1", "h1")).unwrap();
        assert!(record.is_new());
        assert!(store.hash_changed(NS, "a1").unwrap());

        assert!(store.write(|tx| tx.promote_hash(NS, "a1")).unwrap());
        assert!(!store.hash_changed(NS, "a1").unwrap());
        assert_eq!(store.previous_hash(NS, "a1").unwrap(), "h1");

        store.write(|tx| tx.update_hash(NS, "a1", "h2")).unwrap();
        assert!(store.hash_changed(NS, "a1").unwrap());
        assert_eq!(store.previous_hash(NS, "a1").unwrap(), "h1");
    }

    #[test]
    fn same_hash_update_stays_unchanged() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                tx.update_hash(NS, "a1", "h1")?;
                tx.promote_hash(NS, "a1")
            })
            .unwrap();

        store.write(|tx| tx.update_hash(NS, "a1", "h1")).unwrap();
        assert!(!store.hash_changed(NS, "a1").unwrap());
        assert!(!store.write(|tx| tx.promote_hash(NS, "a1")).unwrap());
    }

    #[test]
    fn crash_before_promote_leaves_record_changed() {
        let store = StateStore::open_in_memory().unwrap();
        store.write(|tx| tx.update_hash(NS, "a1", "h1")).unwrap();
        // No promote: the side effect never confirmed.
        let record = store.hash_record(NS, "a1").unwrap().unwrap();
        assert!(record.is_changed());
        assert!(record.previous_hash.is_none());
    }

    #[test]
    fn reset_forces_new() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                tx.update_hash(NS, "a1", "h1")?;
                tx.promote_hash(NS, "a1")
            })
            .unwrap();

        assert!(store.write(|tx| tx.reset_hash(NS, "a1")).unwrap());
        let record = store.hash_record(NS, "a1").unwrap().unwrap();
        assert!(record.is_new());
        assert!(!store.write(|tx| tx.reset_hash(NS, "a1")).unwrap());
        assert!(!store.write(|tx| tx.reset_hash(NS, "missing")).unwrap());
    }

    #[test]
    fn promote_missing_record_is_an_error() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.write(|tx| tx.promote_hash(NS, "ghost")).unwrap_err();
        assert!(matches!(
            err,
            StateError::MissingHashRecord { ref namespace, ref key } if namespace == NS && key == "ghost"
        ));
    }

    #[test]
    fn remove_deletes_record() {
        let store = StateStore::open_in_memory().unwrap();
        store.write(|tx| tx.update_hash(NS, "a1", "h1")).unwrap();
        assert!(store.write(|tx| tx.remove_hash(NS, "a1")).unwrap());
        assert!(store.hash_record(NS, "a1").unwrap().is_none());
        assert!(!store.write(|tx| tx.remove_hash(NS, "a1")).unwrap());
    }

    #[test]
    fn namespaces_are_isolated() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|tx| {
                tx.update_hash("web_allocation", "k", "h1")?;
                tx.promote_hash("web_allocation", "k")
            })
            .unwrap();
        assert!(store.hash_changed("api_allocation", "k").unwrap());
    }
}

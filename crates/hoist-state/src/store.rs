//! StateStore — redb-backed state persistence for hoist.
//!
//! Reads go through the [`StateRead`] trait, implemented by a point-in-time
//! [`Snapshot`], by an open write transaction ([`Txn`], which sees its own
//! uncommitted writes), and by the store itself (one short read
//! transaction per call). Writes only happen inside [`StateStore::write`].

use std::path::Path;
use std::sync::Arc;

use redb::{
    Database, ReadTransaction, ReadableDatabase, ReadableTable, TableHandle, WriteTransaction,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::{self, JsonTable};
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in tables::ALL {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Take a consistent point-in-time view of the store.
    pub fn snapshot(&self) -> StateResult<Snapshot> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        Ok(Snapshot { txn })
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and is aborted when it
    /// returns `Err`, so each call is an atomic unit. Callers may use their
    /// own error type as long as store errors convert into it.
    pub fn write<R, E>(&self, f: impl FnOnce(&mut Txn) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StateError>,
    {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| StateError::Transaction(e.to_string()))?;
        let mut txn = Txn { txn };
        match f(&mut txn) {
            Ok(value) => {
                txn.txn
                    .commit()
                    .map_err(|e| StateError::Transaction(e.to_string()))?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort) = txn.txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(err)
            }
        }
    }
}

impl StateRead for StateStore {
    fn get_raw(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>> {
        self.snapshot()?.get_raw(table, key)
    }

    fn scan_raw(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        self.snapshot()?.scan_raw(table, prefix)
    }
}

/// A read-only, point-in-time view.
pub struct Snapshot {
    txn: ReadTransaction,
}

impl StateRead for Snapshot {
    fn get_raw(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table_get(&table, key)
    }

    fn scan_raw(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table_scan(&table, prefix)
    }
}

/// An open write transaction. Only reachable through [`StateStore::write`].
pub struct Txn {
    txn: WriteTransaction,
}

impl StateRead for Txn {
    fn get_raw(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table_get(&table, key)
    }

    fn scan_raw(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>> {
        let table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table_scan(&table, prefix)
    }
}

impl Txn {
    pub(crate) fn put_json<T: Serialize>(
        &mut self,
        table: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| StateError::Encode {
            table: table.name().to_string(),
            key: key.to_string(),
            source,
        })?;
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(key, bytes.as_slice())
            .map_err(map_err!(Storage))?;
        Ok(())
    }

    pub(crate) fn remove_key(&mut self, table: JsonTable, key: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(table).map_err(map_err!(Table))?;
        let existed = table.remove(key).map_err(map_err!(Storage))?.is_some();
        Ok(existed)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Insert or update a worker.
    pub fn put_worker(&mut self, worker: &Worker) -> StateResult<()> {
        self.put_json(tables::WORKERS, &worker.ip, worker)?;
        debug!(worker = %worker.ip, "worker stored");
        Ok(())
    }

    /// Delete a worker row (labels and tags live on the row). Returns true
    /// if it existed.
    pub fn delete_worker(&mut self, ip: &str) -> StateResult<bool> {
        let existed = self.remove_key(tables::WORKERS, ip)?;
        debug!(worker = %ip, existed, "worker deleted");
        Ok(existed)
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert or replace a job, commands and dependency edges included.
    pub fn put_job(&mut self, job: &Job) -> StateResult<()> {
        self.put_json(tables::JOBS, &job.name, job)?;
        debug!(job = %job.name, "job stored");
        Ok(())
    }

    /// Delete a job. Returns true if it existed.
    pub fn delete_job(&mut self, name: &str) -> StateResult<bool> {
        let existed = self.remove_key(tables::JOBS, name)?;
        debug!(job = %name, existed, "job deleted");
        Ok(existed)
    }

    // ── Allocations ────────────────────────────────────────────────

    /// Insert or update an allocation, keyed by its deterministic id.
    pub fn put_allocation(&mut self, alloc: &Allocation) -> StateResult<()> {
        self.put_json(tables::ALLOCATIONS, &alloc.id, alloc)
    }

    /// Hard-delete an allocation row. Returns true if it existed.
    pub fn delete_allocation(&mut self, id: &str) -> StateResult<bool> {
        self.remove_key(tables::ALLOCATIONS, id)
    }

    // ── Counters ───────────────────────────────────────────────────

    /// Increment a counter and return its new value.
    pub fn bump_counter(&mut self, name: &str) -> StateResult<u64> {
        let next = self.counter(name)? + 1;
        self.put_json(tables::COUNTERS, name, &next)?;
        Ok(next)
    }
}

fn table_get<T>(table: &T, key: &str) -> StateResult<Option<Vec<u8>>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    Ok(table
        .get(key)
        .map_err(map_err!(Storage))?
        .map(|guard| guard.value().to_vec()))
}

fn table_scan<T>(table: &T, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (key, value) = entry.map_err(map_err!(Storage))?;
        if key.value().starts_with(prefix) {
            results.push((key.value().to_string(), value.value().to_vec()));
        }
    }
    Ok(results)
}

fn decode<T: DeserializeOwned>(table: JsonTable, key: &str, bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|source| StateError::Corrupt {
        table: table.name().to_string(),
        key: key.to_string(),
        source,
    })
}

/// Typed read access shared by snapshots, write transactions and the store.
pub trait StateRead {
    /// Raw value bytes for `key`.
    fn get_raw(&self, table: JsonTable, key: &str) -> StateResult<Option<Vec<u8>>>;

    /// Every `(key, value)` whose key starts with `prefix`, in key order.
    fn scan_raw(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<(String, Vec<u8>)>>;

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>>
    where
        Self: Sized,
    {
        self.get_raw(table, key)?
            .map(|bytes| decode(table, key, &bytes))
            .transpose()
    }

    fn scan_json<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>>
    where
        Self: Sized,
    {
        self.scan_raw(table, prefix)?
            .iter()
            .map(|(key, bytes)| decode(table, key, bytes))
            .collect()
    }

    fn worker(&self, ip: &str) -> StateResult<Option<Worker>>
    where
        Self: Sized,
    {
        self.get_json(tables::WORKERS, ip)
    }

    /// All workers, ordered by ordinal.
    fn workers(&self) -> StateResult<Vec<Worker>>
    where
        Self: Sized,
    {
        let mut workers: Vec<Worker> = self.scan_json(tables::WORKERS, "")?;
        workers.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then_with(|| a.ip.cmp(&b.ip)));
        Ok(workers)
    }

    fn job(&self, name: &str) -> StateResult<Option<Job>>
    where
        Self: Sized,
    {
        self.get_json(tables::JOBS, name)
    }

    /// All jobs, ordered by name.
    fn jobs(&self) -> StateResult<Vec<Job>>
    where
        Self: Sized,
    {
        self.scan_json(tables::JOBS, "")
    }

    fn allocation(&self, id: &str) -> StateResult<Option<Allocation>>
    where
        Self: Sized,
    {
        self.get_json(tables::ALLOCATIONS, id)
    }

    /// All allocations, ordered by job then worker.
    fn allocations(&self) -> StateResult<Vec<Allocation>>
    where
        Self: Sized,
    {
        let mut allocs: Vec<Allocation> = self.scan_json(tables::ALLOCATIONS, "")?;
        allocs.sort_by(|a, b| a.job.cmp(&b.job).then_with(|| a.worker.cmp(&b.worker)));
        Ok(allocs)
    }

    fn allocations_for_job(&self, job: &str) -> StateResult<Vec<Allocation>>
    where
        Self: Sized,
    {
        Ok(self
            .allocations()?
            .into_iter()
            .filter(|alloc| alloc.job == job)
            .collect())
    }

    fn allocations_for_worker(&self, ip: &str) -> StateResult<Vec<Allocation>>
    where
        Self: Sized,
    {
        Ok(self
            .allocations()?
            .into_iter()
            .filter(|alloc| alloc.worker == ip)
            .collect())
    }

    /// Current value of a counter (0 if never bumped).
    fn counter(&self, name: &str) -> StateResult<u64>
    where
        Self: Sized,
    {
        Ok(self.get_json(tables::COUNTERS, name)?.unwrap_or(0))
    }

    // ── Ledger ─────────────────────────────────────────────────────

    fn hash_record(&self, namespace: &str, key: &str) -> StateResult<Option<HashRecord>>
    where
        Self: Sized,
    {
        self.get_json(tables::LEDGER, &tables::composite_key(namespace, key))
    }

    /// True if no record exists or its current hash differs from the
    /// previously applied one.
    fn hash_changed(&self, namespace: &str, key: &str) -> StateResult<bool>
    where
        Self: Sized,
    {
        Ok(self
            .hash_record(namespace, key)?
            .is_none_or(|record| record.is_changed()))
    }

    /// Previously applied hash, empty if never applied.
    fn previous_hash(&self, namespace: &str, key: &str) -> StateResult<String>
    where
        Self: Sized,
    {
        Ok(self
            .hash_record(namespace, key)?
            .and_then(|record| record.previous_hash)
            .unwrap_or_default())
    }

    // ── Key-value ──────────────────────────────────────────────────

    fn kv_get(&self, namespace: &str, key: &str) -> StateResult<Option<KvEntry>>
    where
        Self: Sized,
    {
        self.get_json(tables::KV, &tables::composite_key(namespace, key))
    }

    /// Keys of a namespace, in order.
    fn kv_keys(&self, namespace: &str) -> StateResult<Vec<String>>
    where
        Self: Sized,
    {
        let prefix = tables::namespace_prefix(namespace);
        Ok(self
            .scan_raw(tables::KV, &prefix)?
            .into_iter()
            .map(|(key, _)| key[prefix.len()..].to_string())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn worker_put_get_delete() {
        let store = test_store();
        let worker = Worker::new("10.0.0.1", 0).with_labels(["web"]);

        store.write(|tx| tx.put_worker(&worker)).unwrap();
        assert_eq!(store.worker("10.0.0.1").unwrap(), Some(worker));

        assert!(store.write(|tx| tx.delete_worker("10.0.0.1")).unwrap());
        assert!(!store.write(|tx| tx.delete_worker("10.0.0.1")).unwrap());
        assert!(store.worker("10.0.0.1").unwrap().is_none());
    }

    #[test]
    fn workers_are_ordered_by_ordinal() {
        let store = test_store();
        store
            .write(|tx| {
                tx.put_worker(&Worker::new("10.0.0.9", 0))?;
                tx.put_worker(&Worker::new("10.0.0.1", 2))?;
                tx.put_worker(&Worker::new("10.0.0.5", 1))
            })
            .unwrap();

        let ips: Vec<_> = store.workers().unwrap().into_iter().map(|w| w.ip).collect();
        assert_eq!(ips, vec!["10.0.0.9", "10.0.0.5", "10.0.0.1"]);
    }

    #[test]
    fn failed_closure_rolls_back() {
        let store = test_store();
        let result: StateResult<()> = store.write(|tx| {
            tx.put_job(&Job::new("web"))?;
            Err(StateError::Storage("boom".into()))
        });

        assert!(result.is_err());
        assert!(store.job("web").unwrap().is_none());
    }

    #[test]
    fn txn_sees_its_own_writes() {
        let store = test_store();
        store
            .write(|tx| {
                tx.put_allocation(&Allocation::new("web", "10.0.0.1"))?;
                assert_eq!(tx.allocations()?.len(), 1);
                Ok::<(), StateError>(())
            })
            .unwrap();
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let store = test_store();
        store.write(|tx| tx.put_job(&Job::new("web"))).unwrap();

        let snapshot = store.snapshot().unwrap();
        store.write(|tx| tx.put_job(&Job::new("api"))).unwrap();

        assert_eq!(snapshot.jobs().unwrap().len(), 1);
        assert_eq!(store.jobs().unwrap().len(), 2);
    }

    #[test]
    fn allocations_filter_by_job_and_worker() {
        let store = test_store();
        store
            .write(|tx| {
                tx.put_allocation(&Allocation::new("web", "10.0.0.1"))?;
                tx.put_allocation(&Allocation::new("web", "10.0.0.2"))?;
                tx.put_allocation(&Allocation::new("db", "10.0.0.1"))
            })
            .unwrap();

        assert_eq!(store.allocations_for_job("web").unwrap().len(), 2);
        assert_eq!(store.allocations_for_worker("10.0.0.1").unwrap().len(), 2);
        let id = hoist_core::alloc_id("db", "10.0.0.1");
        assert!(store.write(|tx| tx.delete_allocation(&id)).unwrap());
        assert_eq!(store.allocations().unwrap().len(), 2);
    }

    #[test]
    fn counters_start_at_zero() {
        let store = test_store();
        assert_eq!(store.counter(UPDATE_SEQUENCE).unwrap(), 0);
        assert_eq!(store.write(|tx| tx.bump_counter(UPDATE_SEQUENCE)).unwrap(), 1);
        assert_eq!(store.write(|tx| tx.bump_counter(UPDATE_SEQUENCE)).unwrap(), 2);
        assert_eq!(store.counter(UPDATE_SEQUENCE).unwrap(), 2);
    }

    #[test]
    fn undecodable_row_names_table_and_key() {
        let store = test_store();
        store
            .write(|tx| tx.put_json(tables::JOBS, "web", &"not a job"))
            .unwrap();

        match store.job("web") {
            Err(StateError::Corrupt { table, key, .. }) => {
                assert_eq!(table, "jobs");
                assert_eq!(key, "web");
            }
            other => panic!("expected a corrupt-row error, got {other:?}"),
        }
        assert!(matches!(store.jobs(), Err(StateError::Corrupt { .. })));
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.write(|tx| tx.put_job(&Job::new("web"))).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.job("web").unwrap().map(|j| j.name), Some("web".to_string()));
    }
}

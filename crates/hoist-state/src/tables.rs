//! redb table definitions for the hoist state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Composite keys join their parts with [`KEY_SEP`].

use redb::TableDefinition;

/// Table definition shape shared by every hoist table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Separator for composite keys. Never valid inside a name.
pub const KEY_SEP: char = '\u{1f}';

/// Workers keyed by IP address.
pub const WORKERS: JsonTable = TableDefinition::new("workers");

/// Jobs keyed by name.
pub const JOBS: JsonTable = TableDefinition::new("jobs");

/// Allocations keyed by deterministic allocation id.
pub const ALLOCATIONS: JsonTable = TableDefinition::new("allocations");

/// Hash ledger keyed by `{namespace}{KEY_SEP}{key}`.
pub const LEDGER: JsonTable = TableDefinition::new("ledger");

/// Versioned key-value entries keyed by `{namespace}{KEY_SEP}{key}`.
pub const KV: JsonTable = TableDefinition::new("kv");

/// Monotonic counters keyed by name.
pub const COUNTERS: JsonTable = TableDefinition::new("counters");

/// Every table, for creation at open time.
pub const ALL: [JsonTable; 6] = [WORKERS, JOBS, ALLOCATIONS, LEDGER, KV, COUNTERS];

/// Build a composite key.
pub fn composite_key(namespace: &str, key: &str) -> String {
    format!("{namespace}{KEY_SEP}{key}")
}

/// Prefix matching every composite key of `namespace`.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{namespace}{KEY_SEP}")
}

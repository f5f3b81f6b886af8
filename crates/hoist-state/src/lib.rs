//! hoist-state — embedded state store for hoist.
//!
//! Backed by [redb](https://docs.rs/redb), holds workers, jobs,
//! allocations, the two-generation hash ledger, the versioned key-value
//! store used for templating, and run counters.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys join their parts with [`tables::KEY_SEP`] so a prefix
//! scan finds every entry of a namespace.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is threaded explicitly through every caller. Reads go through a
//! [`Snapshot`]; writes happen inside [`StateStore::write`], which commits
//! the closure's changes atomically or not at all. Callers that need
//! checkpoints simply issue one `write` per phase.

pub mod error;
pub mod kv;
pub mod ledger;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{Snapshot, StateRead, StateStore, Txn};
pub use types::*;

//! # key-store
//!
//! `key-store` defines a trait [`KeyStore`] that provides the TTL-capable
//! key-value operations the lease manager needs: plain reads and writes with
//! an expiry, an atomic compare-and-swap, and a free-key index kept in step
//! with every write.
//!
//! The trait is not meant to encode any lease rules. Those live in the
//! `lease-manager` crate, which wraps a `KeyStore` and only ever changes a
//! record's lease state through [`KeyStore::compare_and_swap`].
//!
//! Two backends are provided:
//! - [`memory::MemoryStore`] keeps everything in process, with expiry driven by
//!   an injected [`Clock`]. Used for tests and single-node runs.
//! - [`redis::RedisStore`] talks to Redis/KeyDB through a `fred` pool and
//!   implements the conditional writes as Lua scripts.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::time::Duration;

use async_trait::async_trait;

pub mod clock;
pub mod memory;
pub mod models;
pub mod redis;

pub use clock::{Clock, FakeClock, SystemClock};
pub use models::{CodecError, LeaseRecord};

/// What a conditional write does with the entry's remaining lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Leave the existing expiry exactly as it is.
    Keep,
    /// Expire `Duration` from now.
    In(Duration),
}

#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;

    /// create or overwrite `key`, expiring after `ttl`. Free records are
    /// added to the free index.
    async fn put(&self, key: &str, record: &LeaseRecord, ttl: Duration)
    -> Result<(), Self::Error>;

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error>;

    /// replaces the value at `key` with `new` only if it currently equals
    /// `expected`. The free index is updated in the same atomic step.
    /// Returns `false` if the stored value changed or the key is gone.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &LeaseRecord,
        new: &LeaseRecord,
        expiry: Expiry,
    ) -> Result<bool, Self::Error>;

    /// remaining lifetime of `key`, `None` if it doesn't exist
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error>;

    /// returns `true` if something was deleted
    async fn delete(&self, key: &str) -> Result<bool, Self::Error>;

    /// all live keys starting with `prefix`, in no particular order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error>;

    /// up to `limit` keys from the head of the free index, oldest record first.
    /// Entries may be stale if their record expired.
    async fn free_candidates(&self, limit: usize) -> Result<Vec<String>, Self::Error>;

    /// drop `key` from the free index
    async fn forget_free(&self, key: &str) -> Result<(), Self::Error>;

    /// put `key` back in the free index if it still holds exactly `record`
    /// and `record` is free. Returns `true` only if an entry was missing and
    /// has been added.
    async fn reindex_free(&self, key: &str, record: &LeaseRecord) -> Result<bool, Self::Error>;
}

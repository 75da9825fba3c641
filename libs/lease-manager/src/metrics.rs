//! Lease metrics.
//!
//! Metrics are lazily initialized on first access via `lazy_static!`.

use lazy_static::lazy_static;
use prometheus::{IntCounter, IntGauge, register_int_counter, register_int_gauge};

lazy_static! {
    /// Count of keys added to the pool
    pub static ref KEYS_CREATED: IntCounter = register_int_counter!(
        "keys_created",
        "count of keys added to the pool"
    ).unwrap();

    /// Count of successful acquisitions
    pub static ref KEYS_ACQUIRED: IntCounter = register_int_counter!(
        "keys_acquired",
        "count of keys leased to a caller"
    ).unwrap();

    /// Count of acquisitions that found no free key
    pub static ref ACQUIRE_MISSES: IntCounter = register_int_counter!(
        "acquire_misses",
        "count of acquisitions that found every key leased"
    ).unwrap();

    /// Count of candidates skipped because they couldn't be read or written
    pub static ref ACQUIRE_CANDIDATE_ERRORS: IntCounter = register_int_counter!(
        "acquire_candidate_errors",
        "count of free-index candidates skipped after a store error"
    ).unwrap();

    /// Count of free keys put back in the free index
    pub static ref INDEX_REPAIRS: IntCounter = register_int_counter!(
        "index_repairs",
        "count of free keys found missing from the free index and re-added"
    ).unwrap();

    /// Count of explicit unblocks that released a lease
    pub static ref KEYS_UNBLOCKED: IntCounter = register_int_counter!(
        "keys_unblocked",
        "count of leases released by force-unblock"
    ).unwrap();

    /// Count of keys deleted
    pub static ref KEYS_DELETED: IntCounter = register_int_counter!(
        "keys_deleted",
        "count of keys deleted from the pool"
    ).unwrap();

    /// Count of keep-alives
    pub static ref KEEP_ALIVES: IntCounter = register_int_counter!(
        "keep_alives",
        "count of key lifetime extensions"
    ).unwrap();

    /// Count of lost compare-and-swap races
    pub static ref CAS_CONFLICTS: IntCounter = register_int_counter!(
        "cas_conflicts",
        "count of conditional writes that lost to a concurrent writer"
    ).unwrap();

    /// Count of reconciler passes
    pub static ref RECONCILE_PASSES: IntCounter = register_int_counter!(
        "reconcile_passes",
        "count of completed reconciler passes"
    ).unwrap();

    /// Count of abandoned leases reclaimed by the reconciler
    pub static ref RECONCILE_RECLAIMED: IntCounter = register_int_counter!(
        "reconcile_reclaimed",
        "count of expired leases returned to the pool"
    ).unwrap();

    /// Count of per-key or per-pass reconciler failures
    pub static ref RECONCILE_ERRORS: IntCounter = register_int_counter!(
        "reconcile_errors",
        "count of reconciler failures"
    ).unwrap();

    /// Gauge: keys that still existed when the last reconciler pass reached them
    pub static ref POOL_SIZE: IntGauge = register_int_gauge!(
        "pool_size",
        "keys that still resolved during the last reconciler pass"
    ).unwrap();

    /// Gauge: keys still leased at the end of the last reconciler pass
    pub static ref POOL_LEASED: IntGauge = register_int_gauge!(
        "pool_leased",
        "keys leased at the end of the last reconciler pass"
    ).unwrap();
}

//! # lease-manager
//!
//! Leases keys out of a pool held in a [`key_store::KeyStore`].
//!
//! [`LeaseManager`] owns the rules: a key is created free, handed to exactly
//! one caller at a time by [`LeaseManager::acquire_any`], and freed either
//! explicitly or by the [`Reconciler`] once its lease window has passed. A
//! key's total lifetime is tracked by the store independently of its lease
//! state and only [`LeaseManager::keep_alive`] changes it.
//!
//! Every lease transition is a compare-and-swap against the record as it was
//! read, so any number of managers may share one store.
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod error;
pub mod manager;
pub mod metrics;
pub mod reconciler;
#[cfg(test)]
mod testing;

pub use error::LeaseError;
pub use manager::{KeyInfo, LeaseConfig, LeaseManager, ReclaimOutcome, RetryPolicy};
pub use reconciler::{ReconcileStats, Reconciler};

//! # keylease
//!
//! Shared runtime pieces for the keylease service: CLI/env configuration,
//! tracing setup and process-level metrics.
#![warn(
    missing_debug_implementations,
    missing_docs,
    missing_copy_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]
pub use anyhow;
pub use chrono;
pub use tokio;
pub use tracing;

pub mod config;
pub mod metrics;

//! # metrics
//!
//! process-level statistics. Lease metrics live with the lease manager.
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{IntGauge, register_int_gauge};

lazy_static! {
    /// When the server started
    pub static ref START_TIME: Instant = Instant::now();

    /// server uptime
    pub static ref UPTIME: IntGauge = register_int_gauge!("uptime", "server uptime (seconds)").unwrap();
}

//! Background reclamation of abandoned leases.
//!
//! Every `interval` the reconciler lists the pool and frees each key whose
//! lease deadline has passed. Remaining lifetime is left exactly as the store
//! has it. Free keys missing from the store's free index are put back, since
//! acquisition only looks at the index.

use std::sync::Arc;
use std::time::Duration;

use key_store::{Clock, KeyStore, SystemClock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::error::LeaseError;
use crate::manager::{LeaseManager, ReclaimOutcome};
use crate::metrics;

/// Default time between passes.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Counts from one reconciler pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// keys that still existed when the pass reached them
    pub scanned: u64,
    pub reclaimed: u64,
    /// free keys put back in the free index
    pub reindexed: u64,
    /// still leased and within their window
    pub held: u64,
    pub errors: u64,
}

#[derive(Debug)]
pub struct Reconciler<S, C = SystemClock> {
    manager: Arc<LeaseManager<S, C>>,
    interval: Duration,
    token: CancellationToken,
}

impl<S, C> Reconciler<S, C>
where
    S: KeyStore,
    C: Clock,
{
    pub fn new(
        manager: Arc<LeaseManager<S, C>>,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            manager,
            interval,
            token,
        }
    }

    /// One pass over the pool. A failure on one key is logged and counted and
    /// the pass moves on to the next; failing to list the pool fails the pass.
    pub async fn run_once(&self) -> Result<ReconcileStats, LeaseError<S::Error>> {
        let ids = self.manager.list_keys().await?;
        let mut stats = ReconcileStats::default();

        for id in ids {
            match self.manager.reclaim_expired(&id).await {
                Ok(outcome) => {
                    stats.scanned += 1;
                    match outcome {
                        ReclaimOutcome::Reclaimed => stats.reclaimed += 1,
                        ReclaimOutcome::Held => stats.held += 1,
                        ReclaimOutcome::Reindexed => stats.reindexed += 1,
                        ReclaimOutcome::Free => {}
                    }
                }
                // expired or deleted since it was listed
                Err(LeaseError::NotFound(_)) => {}
                Err(err) => {
                    stats.scanned += 1;
                    stats.errors += 1;
                    warn!(key = %id, ?err, "failed to reconcile key");
                }
            }
        }

        metrics::RECONCILE_PASSES.inc();
        metrics::RECONCILE_RECLAIMED.inc_by(stats.reclaimed);
        metrics::RECONCILE_ERRORS.inc_by(stats.errors);
        metrics::POOL_SIZE.set(stats.scanned as i64);
        metrics::POOL_LEASED.set(stats.held as i64);
        if stats.reclaimed > 0 || stats.reindexed > 0 || stats.errors > 0 {
            info!(
                scanned = stats.scanned,
                reclaimed = stats.reclaimed,
                reindexed = stats.reindexed,
                errors = stats.errors,
                "reconcile pass completed"
            );
        } else {
            debug!(scanned = stats.scanned, held = stats.held, "reconcile pass completed");
        }
        Ok(stats)
    }

    /// Run passes every `interval` until the token is cancelled. A pass in
    /// progress is finished before the loop checks for cancellation again.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    debug!("reconciler stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        metrics::RECONCILE_ERRORS.inc();
                        warn!(?err, "reconcile pass failed");
                    }
                }
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run().in_current_span())
    }
}

//! The lease state machine.
//!
//! A key is either free or leased. Every change of lease state goes through
//! [`KeyStore::compare_and_swap`] against the record as it was just read, so
//! two writers racing on the same key cannot both win, whether they live in
//! this process or another one sharing the store. A lost race re-reads and
//! tries again up to the [`RetryPolicy`] budget.
//!
//! Total lifetime (how long the key stays in the pool) is owned by the
//! store's expiry. Lease transitions always keep it as-is; only keep-alive
//! changes it.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use key_store::models::chrono_duration;
use key_store::{Clock, Expiry, KeyStore, LeaseRecord, SystemClock};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::LeaseError;
use crate::metrics;

/// Default total lifetime of a key.
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(300);
/// Default maximum hold before a lease is reclaimed.
pub const DEFAULT_LEASE_WINDOW: Duration = Duration::from_secs(60);
/// Default storage prefix for key records.
pub const DEFAULT_KEY_PREFIX: &str = "api_key:";
/// How many free-index entries an acquisition looks at per round trip.
pub const DEFAULT_CANDIDATE_BATCH: usize = 16;

/// Default number of retries after a lost conditional write.
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Retry policy for conditional writes that lose a race.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt, so at most `max_retries + 1`
    /// conditional writes per record.
    pub max_retries: u32,
    /// Base delay between retries (actual delay uses exponential backoff
    /// plus up to `base_delay` of jitter).
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=base_ms)
        };
        exp + Duration::from_millis(jitter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseConfig {
    /// total lifetime given to new keys, and added on each keep-alive
    pub default_lifetime: Duration,
    /// how long a lease lasts before the reconciler may reclaim it
    pub lease_window: Duration,
    pub key_prefix: String,
    pub retry: RetryPolicy,
    pub candidate_batch: usize,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_lifetime: DEFAULT_LIFETIME,
            lease_window: DEFAULT_LEASE_WINDOW,
            key_prefix: DEFAULT_KEY_PREFIX.to_owned(),
            retry: RetryPolicy::default(),
            candidate_batch: DEFAULT_CANDIDATE_BATCH,
        }
    }
}

/// Full state of a key as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub is_leased: bool,
    pub lease_deadline: Option<DateTime<Utc>>,
    /// remaining total lifetime, whole seconds
    pub ttl_remaining: u64,
}

impl KeyInfo {
    fn new(record: LeaseRecord, remaining: Duration) -> Self {
        Self {
            key: record.key,
            created_at: record.created_at,
            is_leased: record.is_leased,
            lease_deadline: record.lease_deadline,
            ttl_remaining: remaining.as_secs(),
        }
    }
}

/// What the reconciler found when it looked at one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// lease had expired and the key is free again
    Reclaimed,
    /// leased and still within its window
    Held,
    /// not leased
    Free,
    /// not leased, and was missing from the free index until now
    Reindexed,
}

enum Transition {
    Written(LeaseRecord),
    Unchanged(LeaseRecord),
}

pub struct LeaseManager<S, C = SystemClock> {
    store: S,
    clock: C,
    config: LeaseConfig,
}

impl<S: std::fmt::Debug, C: std::fmt::Debug> std::fmt::Debug for LeaseManager<S, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("store", &self.store)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

impl<S: KeyStore> LeaseManager<S, SystemClock> {
    pub fn new(store: S, config: LeaseConfig) -> Self {
        Self::with_clock(store, config, SystemClock)
    }
}

impl<S, C> LeaseManager<S, C>
where
    S: KeyStore,
    C: Clock,
{
    pub fn with_clock(store: S, config: LeaseConfig, clock: C) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn storage_key(&self, id: &str) -> String {
        format!("{}{}", self.config.key_prefix, id)
    }

    fn id_of<'a>(&self, storage_key: &'a str) -> &'a str {
        storage_key
            .strip_prefix(&self.config.key_prefix)
            .unwrap_or(storage_key)
    }

    /// Add a new free key to the pool. Returns its identifier.
    pub async fn create_key(&self) -> Result<String, LeaseError<S::Error>> {
        let id = Uuid::new_v4().to_string();
        let record = LeaseRecord::new(id.clone(), self.clock.now());
        record.validate().map_err(LeaseError::InvalidRecord)?;

        self.store
            .put(
                &self.storage_key(&id),
                &record,
                self.config.default_lifetime,
            )
            .await?;

        metrics::KEYS_CREATED.inc();
        info!(key = %id, lifetime = ?self.config.default_lifetime, "key created");
        Ok(id)
    }

    /// Lease the oldest free key for `lease_window`.
    ///
    /// Candidates come only from the store's free index; an empty index means
    /// no free key. Free records missing from the index are put back by the
    /// reconciler. A candidate that can't be read or written is skipped, and
    /// its error is returned only if no candidate could be looked at.
    pub async fn acquire_any(&self) -> Result<String, LeaseError<S::Error>> {
        let mut seen = HashSet::new();
        let mut evaluated = 0usize;
        let mut first_err = None;
        loop {
            // entries that were skipped stay at the head of the index
            let limit = seen.len() + self.config.candidate_batch;
            let candidates = self.store.free_candidates(limit).await?;
            let fresh = candidates
                .into_iter()
                .filter(|key| seen.insert(key.clone()))
                .collect::<Vec<_>>();
            if fresh.is_empty() {
                break;
            }
            for key in fresh {
                match self.try_lease(&key).await {
                    Ok(Some(Transition::Written(record))) => return Ok(self.acquired(record)),
                    Ok(Some(Transition::Unchanged(_))) => {
                        evaluated += 1;
                        trace!(key = %key, "candidate already leased, trying next");
                    }
                    Ok(None) => {
                        evaluated += 1;
                        debug!(key = %key, "dropping stale free index entry");
                        if let Err(err) = self.store.forget_free(&key).await {
                            warn!(key = %key, ?err, "failed to drop stale free index entry");
                        }
                    }
                    Err(err) => {
                        metrics::ACQUIRE_CANDIDATE_ERRORS.inc();
                        warn!(key = %key, ?err, "skipping unusable candidate");
                        first_err.get_or_insert(err);
                    }
                }
            }
        }

        if evaluated == 0
            && let Some(err) = first_err
        {
            return Err(err);
        }
        metrics::ACQUIRE_MISSES.inc();
        debug!("no free key available");
        Err(LeaseError::NoFreeKey)
    }

    fn acquired(&self, record: LeaseRecord) -> String {
        metrics::KEYS_ACQUIRED.inc();
        info!(
            key = %record.key,
            deadline = ?record.lease_deadline,
            "key leased"
        );
        record.key
    }

    async fn try_lease(&self, key: &str) -> Result<Option<Transition>, LeaseError<S::Error>> {
        let deadline = self.clock.now() + chrono_duration(self.config.lease_window);
        self.transition(key, |record| {
            (!record.is_leased).then(|| record.leased_until(deadline))
        })
        .await
    }

    /// Current state and remaining lifetime of a key.
    pub async fn get_info(&self, id: &str) -> Result<KeyInfo, LeaseError<S::Error>> {
        let key = self.storage_key(id);
        let record = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| LeaseError::NotFound(id.to_owned()))?;
        let remaining = self
            .store
            .remaining_ttl(&key)
            .await?
            .ok_or_else(|| LeaseError::NotFound(id.to_owned()))?;
        Ok(KeyInfo::new(record, remaining))
    }

    /// Release the key whatever its state. Calling this on a free key changes
    /// nothing.
    pub async fn force_unblock(&self, id: &str) -> Result<KeyInfo, LeaseError<S::Error>> {
        let key = self.storage_key(id);
        match self
            .transition(&key, |record| record.is_leased.then(|| record.freed()))
            .await?
        {
            Some(Transition::Written(_)) => {
                metrics::KEYS_UNBLOCKED.inc();
                info!(key = %id, "key unblocked");
            }
            Some(Transition::Unchanged(_)) => {
                debug!(key = %id, "unblock on a free key, nothing to do");
            }
            None => return Err(LeaseError::NotFound(id.to_owned())),
        }
        self.get_info(id).await
    }

    /// Remove the key from the pool, leased or not.
    pub async fn delete(&self, id: &str) -> Result<(), LeaseError<S::Error>> {
        if !self.store.delete(&self.storage_key(id)).await? {
            return Err(LeaseError::NotFound(id.to_owned()));
        }
        metrics::KEYS_DELETED.inc();
        info!(key = %id, "key deleted");
        Ok(())
    }

    /// Add `default_lifetime` to whatever lifetime the key has left. Lease
    /// state is not touched. Returns the new remaining lifetime.
    pub async fn keep_alive(&self, id: &str) -> Result<Duration, LeaseError<S::Error>> {
        let key = self.storage_key(id);
        let mut attempts = 0;
        loop {
            let Some(current) = self.store.get(&key).await? else {
                return Err(LeaseError::NotFound(id.to_owned()));
            };
            let Some(remaining) = self.store.remaining_ttl(&key).await? else {
                return Err(LeaseError::NotFound(id.to_owned()));
            };
            let extended = remaining.saturating_add(self.config.default_lifetime);
            // bump the revision so concurrent keep-alives can't both extend
            // from the same remaining lifetime
            let touched = current.touched();
            if self
                .store
                .compare_and_swap(&key, &current, &touched, Expiry::In(extended))
                .await?
            {
                metrics::KEEP_ALIVES.inc();
                info!(key = %id, remaining = ?extended, "key kept alive");
                return Ok(extended);
            }
            self.lost_race(&key, &mut attempts).await?;
        }
    }

    /// Identifiers of every key currently in the pool.
    pub async fn list_keys(&self) -> Result<Vec<String>, LeaseError<S::Error>> {
        Ok(self
            .store
            .list_keys(&self.config.key_prefix)
            .await?
            .iter()
            .map(|key| self.id_of(key).to_owned())
            .collect())
    }

    /// Free the key if its lease deadline has passed. Remaining lifetime is
    /// preserved exactly. A free key missing from the free index is put back
    /// in it.
    pub async fn reclaim_expired(&self, id: &str) -> Result<ReclaimOutcome, LeaseError<S::Error>> {
        let key = self.storage_key(id);
        let now = self.clock.now();
        match self
            .transition(&key, |record| record.lease_expired(now).then(|| record.freed()))
            .await?
        {
            Some(Transition::Written(_)) => {
                info!(key = %id, "expired lease reclaimed");
                Ok(ReclaimOutcome::Reclaimed)
            }
            Some(Transition::Unchanged(record)) if record.is_leased => Ok(ReclaimOutcome::Held),
            Some(Transition::Unchanged(record)) => {
                if self.store.reindex_free(&key, &record).await? {
                    metrics::INDEX_REPAIRS.inc();
                    warn!(key = %id, "free key was missing from the free index");
                    Ok(ReclaimOutcome::Reindexed)
                } else {
                    Ok(ReclaimOutcome::Free)
                }
            }
            None => Err(LeaseError::NotFound(id.to_owned())),
        }
    }

    /// Read-check-write loop. `next` decides from the current record what to
    /// write, or `None` to leave it alone. Returns `None` if the key doesn't
    /// exist.
    async fn transition<F>(
        &self,
        key: &str,
        mut next: F,
    ) -> Result<Option<Transition>, LeaseError<S::Error>>
    where
        F: FnMut(&LeaseRecord) -> Option<LeaseRecord> + Send,
    {
        let mut attempts = 0;
        loop {
            let Some(current) = self.store.get(key).await? else {
                return Ok(None);
            };
            let Some(new) = next(&current) else {
                return Ok(Some(Transition::Unchanged(current)));
            };
            new.validate().map_err(LeaseError::InvalidRecord)?;
            if self
                .store
                .compare_and_swap(key, &current, &new, Expiry::Keep)
                .await?
            {
                return Ok(Some(Transition::Written(new)));
            }
            self.lost_race(key, &mut attempts).await?;
        }
    }

    async fn lost_race(&self, key: &str, attempts: &mut u32) -> Result<(), LeaseError<S::Error>> {
        *attempts += 1;
        metrics::CAS_CONFLICTS.inc();
        if *attempts > self.config.retry.max_retries {
            warn!(key, attempts = *attempts, "conflict retries exhausted");
            return Err(LeaseError::ConflictRetryExhausted {
                key: self.id_of(key).to_owned(),
                attempts: *attempts,
            });
        }
        let delay = self.config.retry.backoff(*attempts);
        debug!(key, attempts = *attempts, ?delay, "lost compare-and-swap, retrying");
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

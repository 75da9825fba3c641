use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::models::{LeaseRecord, chrono_duration};
use crate::{Expiry, KeyStore};

/// In-process store. Entries expire according to the injected clock, so a
/// [`FakeClock`](crate::FakeClock) gives fully deterministic lifetimes.
#[derive(Debug, Clone)]
pub struct MemoryStore<C = SystemClock> {
    inner: Arc<Mutex<Inner>>,
    clock: C,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, MemoryEntry>,
    // (created_at ms, key) for every live free record
    free: BTreeSet<(i64, String)>,
    unavailable: bool,
    failing: HashSet<String>,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    record: LeaseRecord,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store unavailable")]
    Unavailable,
    #[error("injected failure for key {0}")]
    Injected(String),
}

impl MemoryStore<SystemClock> {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MemoryStore<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            clock,
        }
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Make calls touching `key` fail until [`heal_key`](Self::heal_key).
    pub fn fail_key(&self, key: &str) {
        self.inner.lock().failing.insert(key.to_owned());
    }

    pub fn heal_key(&self, key: &str) {
        self.inner.lock().failing.remove(key);
    }

    /// Number of entries currently in the free index.
    pub fn free_len(&self) -> usize {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.purge_expired(now);
        guard.free.len()
    }
}

impl Inner {
    fn check(&self, key: Option<&str>) -> Result<(), MemoryError> {
        if self.unavailable {
            return Err(MemoryError::Unavailable);
        }
        if let Some(key) = key
            && self.failing.contains(key)
        {
            return Err(MemoryError::Injected(key.to_owned()));
        }
        Ok(())
    }

    /// live entry for `key`, dropping it if it has expired
    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&mut MemoryEntry> {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= now);
        if expired {
            self.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn remove(&mut self, key: &str) -> Option<MemoryEntry> {
        let entry = self.entries.remove(key)?;
        self.free
            .remove(&(entry.record.free_score(), key.to_owned()));
        trace!(key, "removed memory entry");
        Some(entry)
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in expired {
            self.remove(&key);
        }
    }

    fn index(&mut self, key: &str, old: Option<&LeaseRecord>, new: &LeaseRecord) {
        if let Some(old) = old {
            self.free.remove(&(old.free_score(), key.to_owned()));
        }
        if !new.is_leased {
            self.free.insert((new.free_score(), key.to_owned()));
        }
    }
}

#[async_trait]
impl<C: Clock> KeyStore for MemoryStore<C> {
    type Error = MemoryError;

    async fn put(
        &self,
        key: &str,
        record: &LeaseRecord,
        ttl: Duration,
    ) -> Result<(), Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;
        let old = guard.remove(key).map(|entry| entry.record);
        guard.index(key, old.as_ref(), record);
        guard.entries.insert(
            key.to_owned(),
            MemoryEntry {
                record: record.clone(),
                expires_at: now + chrono_duration(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;
        Ok(guard.live(key, now).map(|entry| entry.record.clone()))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &LeaseRecord,
        new: &LeaseRecord,
        expiry: Expiry,
    ) -> Result<bool, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;

        let Some(entry) = guard.live(key, now) else {
            return Ok(false);
        };
        if entry.record != *expected {
            return Ok(false);
        }
        entry.record = new.clone();
        if let Expiry::In(ttl) = expiry {
            entry.expires_at = now + chrono_duration(ttl);
        }
        guard.index(key, Some(expected), new);
        Ok(true)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;
        Ok(guard
            .live(key, now)
            .map(|entry| (entry.expires_at - now).to_std().unwrap_or_default()))
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;
        if guard.live(key, now).is_none() {
            return Ok(false);
        }
        Ok(guard.remove(key).is_some())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(None)?;
        guard.purge_expired(now);
        Ok(guard
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn free_candidates(&self, limit: usize) -> Result<Vec<String>, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(None)?;
        guard.purge_expired(now);
        Ok(guard
            .free
            .iter()
            .take(limit)
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn forget_free(&self, key: &str) -> Result<(), Self::Error> {
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;
        guard.free.retain(|(_, k)| k != key);
        Ok(())
    }

    async fn reindex_free(&self, key: &str, record: &LeaseRecord) -> Result<bool, Self::Error> {
        let now = self.clock.now();
        let mut guard = self.inner.lock();
        guard.check(Some(key))?;
        let matches = guard
            .live(key, now)
            .is_some_and(|entry| entry.record == *record && !record.is_leased);
        if !matches {
            return Ok(false);
        }
        Ok(guard.free.insert((record.free_score(), key.to_owned())))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::DateTime;

    use super::{MemoryError, MemoryStore};
    use crate::{Clock, Expiry, FakeClock, KeyStore, LeaseRecord};

    fn store() -> (MemoryStore<FakeClock>, FakeClock) {
        let clock = FakeClock::at(DateTime::from_timestamp(1_700_000_000, 0).unwrap());
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    fn record(key: &str, clock: &FakeClock) -> LeaseRecord {
        LeaseRecord::new(key, clock.now())
    }

    #[tokio::test]
    async fn put_get_and_expire() {
        let (store, clock) = store();
        let rec = record("a", &clock);
        store
            .put("p:a", &rec, Duration::from_secs(300))
            .await
            .expect("put");

        assert_eq!(store.get("p:a").await.expect("get"), Some(rec));
        assert_eq!(
            store.remaining_ttl("p:a").await.expect("ttl"),
            Some(Duration::from_secs(300))
        );

        clock.advance(Duration::from_secs(300));
        assert_eq!(store.get("p:a").await.expect("get"), None);
        assert_eq!(store.remaining_ttl("p:a").await.expect("ttl"), None);
        assert!(store.list_keys("p:").await.expect("list").is_empty());
        assert_eq!(store.free_len(), 0);
    }

    #[tokio::test]
    async fn compare_and_swap_checks_expected_value() {
        let (store, clock) = store();
        let rec = record("a", &clock);
        store
            .put("p:a", &rec, Duration::from_secs(300))
            .await
            .expect("put");
        let leased = rec.leased_until(clock.now());

        assert!(
            store
                .compare_and_swap("p:a", &rec, &leased, Expiry::Keep)
                .await
                .expect("first cas")
        );
        // second writer still holds the old value
        assert!(
            !store
                .compare_and_swap("p:a", &rec, &leased, Expiry::Keep)
                .await
                .expect("second cas")
        );
        assert!(
            !store
                .compare_and_swap("p:missing", &rec, &leased, Expiry::Keep)
                .await
                .expect("missing cas")
        );
    }

    #[tokio::test]
    async fn compare_and_swap_keep_preserves_ttl() {
        let (store, clock) = store();
        let rec = record("a", &clock);
        store
            .put("p:a", &rec, Duration::from_secs(300))
            .await
            .expect("put");
        clock.advance(Duration::from_secs(40));

        let leased = rec.leased_until(clock.now());
        store
            .compare_and_swap("p:a", &rec, &leased, Expiry::Keep)
            .await
            .expect("cas");
        assert_eq!(
            store.remaining_ttl("p:a").await.expect("ttl"),
            Some(Duration::from_secs(260))
        );

        let touched = leased.touched();
        store
            .compare_and_swap("p:a", &leased, &touched, Expiry::In(Duration::from_secs(560)))
            .await
            .expect("cas");
        assert_eq!(
            store.remaining_ttl("p:a").await.expect("ttl"),
            Some(Duration::from_secs(560))
        );
    }

    #[tokio::test]
    async fn free_index_follows_lease_state() {
        let (store, clock) = store();
        let older = record("older", &clock);
        clock.advance(Duration::from_secs(1));
        let newer = record("newer", &clock);

        // insertion order doesn't matter, creation order does
        store
            .put("p:newer", &newer, Duration::from_secs(300))
            .await
            .expect("put newer");
        store
            .put("p:older", &older, Duration::from_secs(300))
            .await
            .expect("put older");
        assert_eq!(
            store.free_candidates(10).await.expect("candidates"),
            vec!["p:older".to_owned(), "p:newer".to_owned()]
        );

        let leased = older.leased_until(clock.now());
        store
            .compare_and_swap("p:older", &older, &leased, Expiry::Keep)
            .await
            .expect("lease");
        assert_eq!(
            store.free_candidates(10).await.expect("candidates"),
            vec!["p:newer".to_owned()]
        );

        store
            .compare_and_swap("p:older", &leased, &leased.freed(), Expiry::Keep)
            .await
            .expect("free");
        assert_eq!(store.free_candidates(1).await.expect("candidates"), vec![
            "p:older".to_owned()
        ]);

        assert!(store.delete("p:older").await.expect("delete"));
        assert!(!store.delete("p:older").await.expect("delete again"));
        assert_eq!(store.free_candidates(10).await.expect("candidates"), vec![
            "p:newer".to_owned()
        ]);

        store.forget_free("p:newer").await.expect("forget");
        assert!(store.free_candidates(10).await.expect("candidates").is_empty());
        // forgetting the index entry leaves the record alone
        assert!(store.get("p:newer").await.expect("get").is_some());

        assert!(store.reindex_free("p:newer", &newer).await.expect("reindex"));
        assert!(!store.reindex_free("p:newer", &newer).await.expect("reindex again"));
        assert_eq!(store.free_candidates(10).await.expect("candidates"), vec![
            "p:newer".to_owned()
        ]);
    }

    #[tokio::test]
    async fn reindex_free_checks_the_stored_record() {
        let (store, clock) = store();
        let rec = record("a", &clock);
        store
            .put("p:a", &rec, Duration::from_secs(300))
            .await
            .expect("put");
        let leased = rec.leased_until(clock.now());
        store
            .compare_and_swap("p:a", &rec, &leased, Expiry::Keep)
            .await
            .expect("lease");

        // stale view of the record
        assert!(!store.reindex_free("p:a", &rec).await.expect("stale"));
        // leased records never go in the index
        assert!(!store.reindex_free("p:a", &leased).await.expect("leased"));
        // nor do missing ones
        assert!(!store.reindex_free("p:missing", &rec).await.expect("missing"));
        assert_eq!(store.free_len(), 0);
    }

    #[tokio::test]
    async fn injected_failures() {
        let (store, clock) = store();
        store
            .put("p:a", &record("a", &clock), Duration::from_secs(300))
            .await
            .expect("put");

        store.fail_key("p:a");
        assert!(matches!(
            store.get("p:a").await,
            Err(MemoryError::Injected(key)) if key == "p:a"
        ));
        // other keys and listing are unaffected
        assert_eq!(store.list_keys("p:").await.expect("list").len(), 1);
        store.heal_key("p:a");
        assert!(store.get("p:a").await.expect("get").is_some());

        store.set_unavailable(true);
        assert!(matches!(
            store.list_keys("p:").await,
            Err(MemoryError::Unavailable)
        ));
        store.set_unavailable(false);
        assert!(store.list_keys("p:").await.is_ok());
    }
}

//! Store wrapper for tests that need to watch or disturb store traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use key_store::memory::{MemoryError, MemoryStore};
use key_store::{Expiry, FakeClock, KeyStore, LeaseRecord};
use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub(crate) struct Counters {
    pub(crate) gets: Arc<AtomicUsize>,
    pub(crate) lists: Arc<AtomicUsize>,
    pub(crate) swaps: Arc<AtomicUsize>,
}

impl Counters {
    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub(crate) fn lists(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    pub(crate) fn swaps(&self) -> usize {
        self.swaps.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.gets.store(0, Ordering::SeqCst);
        self.lists.store(0, Ordering::SeqCst);
        self.swaps.store(0, Ordering::SeqCst);
    }
}

/// `MemoryStore` that counts reads, can report keys that don't exist and can
/// make every compare-and-swap lose.
#[derive(Debug, Clone)]
pub(crate) struct TestStore {
    pub(crate) inner: MemoryStore<FakeClock>,
    pub(crate) counters: Counters,
    ghosts: Arc<Mutex<Vec<String>>>,
    contended: Arc<AtomicBool>,
}

impl TestStore {
    pub(crate) fn new(clock: FakeClock) -> Self {
        Self {
            inner: MemoryStore::with_clock(clock),
            counters: Counters::default(),
            ghosts: Arc::default(),
            contended: Arc::default(),
        }
    }

    /// list `key` as if it existed
    pub(crate) fn add_ghost(&self, key: impl Into<String>) {
        self.ghosts.lock().push(key.into());
    }

    pub(crate) fn set_contended(&self, contended: bool) {
        self.contended.store(contended, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyStore for TestStore {
    type Error = MemoryError;

    async fn put(&self, key: &str, record: &LeaseRecord, ttl: Duration) -> Result<(), Self::Error> {
        self.inner.put(key, record, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<LeaseRecord>, Self::Error> {
        self.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &LeaseRecord,
        new: &LeaseRecord,
        expiry: Expiry,
    ) -> Result<bool, Self::Error> {
        self.counters.swaps.fetch_add(1, Ordering::SeqCst);
        if self.contended.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.compare_and_swap(key, expected, new, expiry).await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, Self::Error> {
        self.inner.remaining_ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        self.inner.delete(key).await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        self.counters.lists.fetch_add(1, Ordering::SeqCst);
        let mut keys = self.inner.list_keys(prefix).await?;
        keys.extend(
            self.ghosts
                .lock()
                .iter()
                .filter(|key| key.starts_with(prefix))
                .cloned(),
        );
        Ok(keys)
    }

    async fn free_candidates(&self, limit: usize) -> Result<Vec<String>, Self::Error> {
        self.inner.free_candidates(limit).await
    }

    async fn forget_free(&self, key: &str) -> Result<(), Self::Error> {
        self.inner.forget_free(key).await
    }

    async fn reindex_free(&self, key: &str, record: &LeaseRecord) -> Result<bool, Self::Error> {
        self.inner.reindex_free(key, record).await
    }
}

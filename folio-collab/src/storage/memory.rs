//! In-memory document store.
//!
//! Backs embedded single-process deployments and most of the test suite.
//! Behavior matches [`RocksStore`](super::RocksStore) except for
//! durability, so the two are interchangeable behind the
//! [`DocumentStore`] trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::now_ms;
use crate::storage::{DocumentStore, StoreError, StoredDocument};

/// HashMap-backed store with operation counters.
///
/// The counters make write coalescing observable: the debounce contract
/// of the persistence writer is "N schedules, one put", and `put_count`
/// is how that is checked.
pub struct MemoryStore {
    docs: Mutex<HashMap<String, StoredDocument>>,
    gets: AtomicU64,
    puts: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
        }
    }

    fn docs(&self) -> MutexGuard<'_, HashMap<String, StoredDocument>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a record directly, without counting it as a `put`.
    ///
    /// Fixture setup: seeded records do not disturb the counters that
    /// tests assert against.
    pub fn seed(&self, doc_id: &str, title: &str, content: &str) {
        self.docs().insert(
            doc_id.to_string(),
            StoredDocument {
                title: title.to_string(),
                content: content.to_string(),
                updated_at: now_ms(),
            },
        );
    }

    /// Number of `get` calls served.
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of `put` calls applied.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.docs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, doc_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.docs().get(doc_id).cloned())
    }

    fn put(&self, doc_id: &str, title: &str, content: &str) -> Result<(), StoreError> {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.docs().insert(
            doc_id.to_string(),
            StoredDocument {
                title: title.to_string(),
                content: content.to_string(),
                updated_at: now_ms(),
            },
        );
        Ok(())
    }
}

/// Store whose operations can be switched to fail (test support).
#[cfg(test)]
pub(crate) struct FailingStore {
    inner: MemoryStore,
    fail_gets: std::sync::atomic::AtomicBool,
    fail_puts: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_gets: std::sync::atomic::AtomicBool::new(false),
            fail_puts: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub(crate) fn seed(&self, doc_id: &str, title: &str, content: &str) {
        self.inner.seed(doc_id, title, content);
    }

    pub(crate) fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn put_count(&self) -> u64 {
        self.inner.put_count()
    }
}

#[cfg(test)]
impl DocumentStore for FailingStore {
    fn get(&self, doc_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected get failure".into()));
        }
        self.inner.get(doc_id)
    }

    fn put(&self, doc_id: &str, title: &str, content: &str) -> Result<(), StoreError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseError("injected put failure".into()));
        }
        self.inner.put(doc_id, title, content)
    }
}

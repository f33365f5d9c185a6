// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory key/expiry cache store.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::traits::CacheStore;

#[derive(Clone, Debug)]
struct Entry {
    expires: Option<u64>,
    bytes: Vec<u8>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InnerCacheStore {
    entries: HashMap<String, Entry>,
}

/// Cache store keeping all entries in memory.
///
/// Supports usage in asynchronous and multi-threaded contexts by wrapping the
/// inner store with an `RwLock` and `Arc`; clones share the same entries.
#[derive(Clone, Debug, Default)]
pub struct MemoryCacheStore {
    inner: Arc<RwLock<InnerCacheStore>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, InnerCacheStore> {
        self.inner
            .read()
            .expect("acquire shared read access on store")
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, InnerCacheStore> {
        self.inner
            .write()
            .expect("acquire exclusive write access on store")
    }

    /// Number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.read_store().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_store().entries.is_empty()
    }

    /// Overrides the expiry of an entry, to age it artificially.
    #[cfg(any(test, feature = "test_utils"))]
    pub fn set_expires(&self, key: &str, expires: Option<u64>) {
        let mut store = self.write_store();
        if let Some(entry) = store.entries.get_mut(key) {
            entry.expires = expires;
        }
    }
}

impl CacheStore for MemoryCacheStore {
    type Error = Infallible;

    async fn store(&self, key: &str, expires: Option<u64>, bytes: Vec<u8>) -> Result<(), Infallible> {
        let mut store = self.write_store();
        store.entries.insert(key.to_string(), Entry { expires, bytes });
        Ok(())
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>, Infallible> {
        let store = self.read_store();
        let bytes = match store.entries.get(key) {
            Some(entry) if !entry.is_expired(current_timestamp()) => Some(entry.bytes.clone()),
            _ => None,
        };
        Ok(bytes)
    }

    async fn remove(&self, key: &str) -> Result<(), Infallible> {
        let mut store = self.write_store();
        store.entries.remove(key);
        Ok(())
    }

    async fn prune(&self) -> Result<(), Infallible> {
        let now = current_timestamp();
        let mut store = self.write_store();
        store.entries.retain(|_, entry| !entry.is_expired(now));
        Ok(())
    }
}

/// Current UNIX time in seconds, the unit expiry hints are expressed in.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is not behind")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_and_fetch() {
        let store = MemoryCacheStore::new();

        store.store("a", None, b"first".to_vec()).await.unwrap();
        assert_eq!(store.fetch("a").await.unwrap(), Some(b"first".to_vec()));
        assert_eq!(store.fetch("b").await.unwrap(), None);

        // Replaces previous entry under the same key.
        store.store("a", None, b"second".to_vec()).await.unwrap();
        assert_eq!(store.fetch("a").await.unwrap(), Some(b"second".to_vec()));

        store.remove("a").await.unwrap();
        assert_eq!(store.fetch("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = MemoryCacheStore::new();

        store.store("a", None, b"keep".to_vec()).await.unwrap();
        store.store("b", None, b"expire".to_vec()).await.unwrap();
        store.set_expires("b", Some(1));

        assert_eq!(store.fetch("a").await.unwrap(), Some(b"keep".to_vec()));
        assert_eq!(store.fetch("b").await.unwrap(), None);
        assert_eq!(store.len(), 2);

        store.prune().await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.fetch("a").await.unwrap(), Some(b"keep".to_vec()));
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let store = MemoryCacheStore::new();
        let clone = store.clone();

        store.store("a", None, b"shared".to_vec()).await.unwrap();
        assert_eq!(clone.fetch("a").await.unwrap(), Some(b"shared".to_vec()));
    }
}

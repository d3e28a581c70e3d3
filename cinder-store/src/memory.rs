// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory storage implementation.
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::traits::{SecureStorage, WriteBatch, WriteOp};

/// Volatile storage keeping all values in a shared map.
///
/// Clones share the same underlying map, which makes it easy to hand the same storage to several
/// components of one device.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl SecureStorage for MemoryStorage {
    type Error = Infallible;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Self::Error> {
        self.inner.write().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        Ok(self.inner.write().await.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        let inner = self.inner.read().await;
        let keys = inner
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        Ok(keys)
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<(), Self::Error> {
        // Holding the write lock for the whole batch makes it appear atomic to readers.
        let mut inner = self.inner.write().await;
        for op in batch {
            match op {
                WriteOp::Set(key, value) => {
                    inner.insert(key, value);
                }
                WriteOp::Delete(key) => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::traits::{SecureStorage, WriteBatch};

    use super::MemoryStorage;

    #[tokio::test]
    async fn set_get_delete() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("identity").await.unwrap(), None);

        storage.set("identity", vec![1, 2, 3]).await.unwrap();
        assert_eq!(storage.get("identity").await.unwrap(), Some(vec![1, 2, 3]));

        assert!(storage.delete("identity").await.unwrap());
        assert!(!storage.delete("identity").await.unwrap());
        assert!(storage.is_empty().await);
    }

    #[tokio::test]
    async fn prefix_scan() {
        let storage = MemoryStorage::new();
        storage.set("session/a/b", vec![1]).await.unwrap();
        storage.set("session/a/c", vec![2]).await.unwrap();
        storage.set("sessions", vec![3]).await.unwrap();
        storage.set("identity", vec![4]).await.unwrap();

        let keys = storage.keys_with_prefix("session/").await.unwrap();
        assert_eq!(keys, vec!["session/a/b".to_string(), "session/a/c".to_string()]);
    }

    #[tokio::test]
    async fn batch_applies_in_order() {
        let storage = MemoryStorage::new();
        storage.set("a", vec![0]).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.delete("a").set("b", vec![1]).set("a", vec![2]);
        storage.write_batch(batch).await.unwrap();

        assert_eq!(storage.get("a").await.unwrap(), Some(vec![2]));
        assert_eq!(storage.get("b").await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let storage = MemoryStorage::new();
        let other = storage.clone();
        storage.set("k", vec![7]).await.unwrap();
        assert_eq!(other.get("k").await.unwrap(), Some(vec![7]));
    }
}

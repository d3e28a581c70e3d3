// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage wrappers to simulate faulty platforms in tests.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::memory::MemoryStorage;
use crate::traits::{SecureStorage, WriteBatch};

#[derive(Debug, Error)]
#[error("simulated storage failure")]
pub struct SimulatedFailure;

/// In-memory storage which can be switched into failing reads or writes.
#[derive(Clone, Debug, Default)]
pub struct FailingStorage {
    inner: MemoryStorage,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl FailingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing storage, sharing its contents.
    pub fn wrap(inner: MemoryStorage) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), SimulatedFailure> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SimulatedFailure);
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), SimulatedFailure> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SimulatedFailure);
        }
        Ok(())
    }
}

impl SecureStorage for FailingStorage {
    type Error = SimulatedFailure;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        self.check_read()?;
        let Ok(value) = self.inner.get(key).await;
        Ok(value)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Self::Error> {
        self.check_write()?;
        let Ok(()) = self.inner.set(key, value).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        self.check_write()?;
        let Ok(removed) = self.inner.delete(key).await;
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        self.check_read()?;
        let Ok(keys) = self.inner.keys_with_prefix(prefix).await;
        Ok(keys)
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<(), Self::Error> {
        self.check_write()?;
        let Ok(()) = self.inner.write_batch(batch).await;
        Ok(())
    }
}

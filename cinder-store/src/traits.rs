// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error as StdError;

/// Single write operation inside a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Set(String, Vec<u8>),
    Delete(String),
}

impl WriteOp {
    pub fn key(&self) -> &str {
        match self {
            WriteOp::Set(key, _) => key,
            WriteOp::Delete(key) => key,
        }
    }
}

/// Ordered list of writes which are applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) -> &mut Self {
        self.ops.push(WriteOp::Set(key.into(), value));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::Delete(key.into()));
        self
    }

    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }
}

impl IntoIterator for WriteBatch {
    type Item = WriteOp;
    type IntoIter = std::vec::IntoIter<WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

impl FromIterator<WriteOp> for WriteBatch {
    fn from_iter<T: IntoIterator<Item = WriteOp>>(iter: T) -> Self {
        Self {
            ops: iter.into_iter().collect(),
        }
    }
}

/// Key-value storage for secrets which survives application restarts.
///
/// Values are opaque bytes, keys are plain strings. Prefix scans are used to find all sessions
/// belonging to the local identity.
pub trait SecureStorage {
    type Error: StdError + Send + Sync + 'static;

    /// Returns the value stored under `key` or `None` if nothing was stored.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn set(&self, key: &str, value: Vec<u8>) -> impl Future<Output = Result<(), Self::Error>>;

    /// Removes the value under `key`. Returns `true` if there was a value.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, Self::Error>>;

    /// Returns all keys starting with `prefix` in lexicographic order.
    fn keys_with_prefix(&self, prefix: &str)
    -> impl Future<Output = Result<Vec<String>, Self::Error>>;

    /// Applies all operations of the batch. Either all of them take effect or none.
    fn write_batch(&self, batch: WriteBatch) -> impl Future<Output = Result<(), Self::Error>>;
}

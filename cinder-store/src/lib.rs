// SPDX-License-Identifier: MIT OR Apache-2.0

//! Secure storage for private key material and session state.
//!
//! The session engine never touches a database directly. It persists opaque byte values under
//! string keys through the [`SecureStorage`] trait, which platforms implement on top of whatever
//! secure enclave, keychain or encrypted database they offer.
//!
//! ## Atomic writes
//!
//! Establishing a session consumes a one-time prekey of the device identity _and_ creates new
//! session state. Both writes need to strictly _all_ occur or _none_ occur, otherwise a crash in
//! between could leave a consumed prekey without a session (or the other way around). Writes
//! which belong together are therefore grouped into a [`WriteBatch`] and handed over to
//! [`SecureStorage::write_batch`] in one go.
//!
//! ## Implementations
//!
//! - [`MemoryStorage`]: in-memory map, useful for tests and ephemeral sessions.
//! - `SqliteStorage`: persistent storage on top of SQLite, behind the `sqlite` feature flag.
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
mod traits;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteStorage, SqliteStorageError};
pub use traits::{SecureStorage, WriteBatch, WriteOp};

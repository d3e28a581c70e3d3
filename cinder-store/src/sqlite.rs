// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistent storage.
use sqlx::migrate::MigrateDatabase;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, query};
use thiserror::Error;

use crate::traits::{SecureStorage, WriteBatch, WriteOp};

/// Re-export of SQLite connection pool type.
pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum SqliteStorageError {
    #[error("an error occurred with the sqlite database: {0}")]
    Database(#[from] sqlx::Error),
}

/// SQLite-based persistent storage.
///
/// Platforms are expected to point this at a database file inside their protected application
/// container (or encrypt it at rest). The storage itself does not add another layer of
/// encryption.
#[derive(Clone, Debug)]
pub struct SqliteStorage {
    pub(crate) pool: Pool,
}

impl SqliteStorage {
    /// Create a new `SqliteStorage` using the provided db `Pool`.
    ///
    /// Call [`SqliteStorage::create_tables`] once before using it.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Create the key-value table if it doesn't already exist.
    pub async fn create_tables(&self) -> Result<(), SqliteStorageError> {
        query(
            "
            CREATE TABLE IF NOT EXISTS
                secure_storage_v1 (
                    key TEXT PRIMARY KEY NOT NULL,
                    value BLOB NOT NULL
                )
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Create the database if it doesn't already exist.
pub async fn create_database(url: &str) -> Result<(), SqliteStorageError> {
    if !Sqlite::database_exists(url).await? {
        Sqlite::create_database(url).await?;
    }

    Ok(())
}

/// Create a connection pool.
pub async fn connection_pool(url: &str, max_connections: u32) -> Result<Pool, SqliteStorageError> {
    let pool: Pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    Ok(pool)
}

impl SecureStorage for SqliteStorage {
    type Error = SqliteStorageError;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Self::Error> {
        let row = query("SELECT value FROM secure_storage_v1 WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Vec<u8>, _>("value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), Self::Error> {
        query(
            "
            INSERT INTO
                secure_storage_v1 (key, value)
            VALUES
                (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, Self::Error> {
        let result = query("DELETE FROM secure_storage_v1 WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, Self::Error> {
        // Plain string comparison, LIKE would treat "_" and "%" inside the prefix as wildcards.
        let rows = query(
            "
            SELECT
                key
            FROM
                secure_storage_v1
            WHERE
                substr(key, 1, length(?1)) = ?1
            ORDER BY
                key ASC
            ",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        let keys = rows
            .iter()
            .map(|row| row.try_get::<String, _>("key"))
            .collect::<Result<Vec<String>, sqlx::Error>>()?;

        Ok(keys)
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<(), Self::Error> {
        // Start a transaction.
        //
        // Any writes after this point, and before `commit()`, will be rolled back in the event
        // of an error.
        let mut tx = self.pool.begin().await?;

        for op in batch {
            match op {
                WriteOp::Set(key, value) => {
                    query(
                        "
                        INSERT INTO
                            secure_storage_v1 (key, value)
                        VALUES
                            (?1, ?2)
                        ON CONFLICT(key) DO UPDATE SET value = excluded.value
                        ",
                    )
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Delete(key) => {
                    query("DELETE FROM secure_storage_v1 WHERE key = ?1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::traits::{SecureStorage, WriteBatch};

    use super::{SqliteStorage, connection_pool};

    async fn initialize_storage() -> SqliteStorage {
        // A single connection, every connection to "sqlite::memory:" opens a fresh database.
        let pool = connection_pool("sqlite::memory:", 1).await.unwrap();
        let storage = SqliteStorage::new(pool);
        storage.create_tables().await.unwrap();
        storage
    }

    #[tokio::test]
    async fn set_get_overwrite() {
        let storage = initialize_storage().await;
        assert_eq!(storage.get("identity").await.unwrap(), None);

        storage.set("identity", vec![1]).await.unwrap();
        storage.set("identity", vec![2]).await.unwrap();
        assert_eq!(storage.get("identity").await.unwrap(), Some(vec![2]));

        assert!(storage.delete("identity").await.unwrap());
        assert!(!storage.delete("identity").await.unwrap());
    }

    #[tokio::test]
    async fn prefix_scan_is_literal() {
        let storage = initialize_storage().await;
        storage.set("session/a_b/1", vec![1]).await.unwrap();
        storage.set("session/axb/1", vec![2]).await.unwrap();
        storage.set("identity", vec![3]).await.unwrap();

        let keys = storage.keys_with_prefix("session/a_b/").await.unwrap();
        assert_eq!(keys, vec!["session/a_b/1".to_string()]);

        let keys = storage.keys_with_prefix("session/").await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn batch_commits_all() {
        let storage = initialize_storage().await;
        storage.set("session/x", vec![0]).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .set("identity", vec![1])
            .delete("session/x")
            .set("session/y", vec![2]);
        storage.write_batch(batch).await.unwrap();

        assert_eq!(storage.get("identity").await.unwrap(), Some(vec![1]));
        assert_eq!(storage.get("session/x").await.unwrap(), None);
        assert_eq!(storage.get("session/y").await.unwrap(), Some(vec![2]));
    }
}

//! store/mod.rs - Durable local storage.
//!
//! Wraps a `sqlx::SqlitePool` with WAL journaling, foreign keys on, and
//! migrations run at open time. Every operation here is one SQL statement;
//! the mutation API composes them into atomic multi-step writes via an
//! explicit transaction.

pub mod checkpoint;
pub mod conflicts;
pub mod entities;
pub mod migrations;
pub mod models;
pub mod outbox;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

use crate::ids::IdGenerator;
use crate::Result;
use models::DEVICE_ID_KEY;

/// Durable local store. Cheap to clone (the pool is reference-counted
/// internally), so it can be shared across the mutation API and a
/// concurrently running sync cycle.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) a SQLite-backed store and runs pending
    /// migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}", db_path.display());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Opens an in-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        migrations::run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<bool> {
        let result: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(result.0 == 1)
    }

    /// Returns this installation's device id, generating and persisting one
    /// under the reserved [`DEVICE_ID_KEY`] setting on first use. Generated
    /// once per installation and kept local-only.
    pub async fn device_id(&self, ids: &dyn IdGenerator) -> Result<String> {
        if let Some(existing) = entities::get_setting_raw(&self.pool, DEVICE_ID_KEY).await? {
            return Ok(existing);
        }

        let new_id = ids.new_id();
        sqlx::query("INSERT OR IGNORE INTO settings (key, value) VALUES (?, ?)")
            .bind(DEVICE_ID_KEY)
            .bind(&new_id)
            .execute(&self.pool)
            .await?;

        // Another concurrent caller may have won the race; read back the
        // row that is actually persisted.
        entities::get_setting_raw(&self.pool, DEVICE_ID_KEY)
            .await?
            .ok_or_else(|| crate::Error::Store("device id disappeared after insert".to_string()))
    }
}

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_all() {
        assert_send_sync::<Store>();
    }
};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_in_memory_and_runs_migrations() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn device_id_is_generated_once_and_persisted() {
        let store = Store::open_in_memory().await.unwrap();
        let ids = crate::ids::UuidGenerator;
        let a = store.device_id(&ids).await.unwrap();
        let b = store.device_id(&ids).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn opens_a_real_file_and_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("synccore.db");

        let store = Store::open(&path).await.unwrap();
        let ids = crate::ids::UuidGenerator;
        let device_id = store.device_id(&ids).await.unwrap();
        drop(store);

        let reopened = Store::open(&path).await.unwrap();
        assert_eq!(reopened.device_id(&ids).await.unwrap(), device_id);
    }
}

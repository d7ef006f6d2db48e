//! store/checkpoint.rs - Singleton checkpoint row.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Checkpoint {
    pub last_sync_cursor: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

pub async fn get_checkpoint(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<Checkpoint> {
    let row = sqlx::query("SELECT last_sync_cursor, last_synced_at FROM checkpoint WHERE id = 1")
        .fetch_one(executor)
        .await?;

    let last_sync_cursor: Option<String> = row.try_get("last_sync_cursor")?;
    let last_synced_at: Option<String> = row.try_get("last_synced_at")?;

    Ok(Checkpoint {
        last_sync_cursor,
        last_synced_at: last_synced_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| crate::Error::Store(format!("invalid stored checkpoint time: {e}")))
            })
            .transpose()?,
    })
}

/// Atomically sets the checkpoint. A single-row UPDATE on SQLite is
/// already atomic.
pub async fn set_checkpoint(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    cursor: Option<&str>,
    synced_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE checkpoint SET last_sync_cursor = ?, last_synced_at = ? WHERE id = 1")
        .bind(cursor)
        .bind(synced_at.map(|t| t.to_rfc3339()))
        .execute(executor)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn starts_empty_and_advances() {
        let store = Store::open_in_memory().await.unwrap();
        let cp = get_checkpoint(store.pool()).await.unwrap();
        assert_eq!(cp, Checkpoint::default());

        let now = Utc::now();
        set_checkpoint(store.pool(), Some("c1"), Some(now)).await.unwrap();
        let cp = get_checkpoint(store.pool()).await.unwrap();
        assert_eq!(cp.last_sync_cursor.as_deref(), Some("c1"));
        assert_eq!(cp.last_synced_at, Some(now));
    }
}

//! store/outbox.rs - Outbox and tombstone tables.
//!
//! Pending/failed counters with an `ON CONFLICT DO UPDATE` enqueue, scoped
//! to a per-entity outbox row shape instead of a generic blob queue.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::models::{EntityType, Operation};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRow {
    pub id: i64,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload_json: Option<String>,
    pub idempotency_key: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for a new outbox row; `idempotency_key` is assigned by the caller
/// (the mutation API) before the row is inserted.
#[derive(Debug, Clone)]
pub struct NewOutboxRow {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub payload_json: Option<String>,
    pub idempotency_key: String,
}

fn row_to_outbox(row: &sqlx::sqlite::SqliteRow) -> Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.try_get("id")?,
        entity_type: EntityType::parse(row.try_get::<String, _>("entity_type")?.as_str())
            .ok_or_else(|| Error::Store("invalid entity_type in outbox row".to_string()))?,
        entity_id: row.try_get("entity_id")?,
        operation: Operation::parse(row.try_get::<String, _>("operation")?.as_str())
            .ok_or_else(|| Error::Store("invalid operation in outbox row".to_string()))?,
        payload_json: row.try_get("payload_json")?,
        idempotency_key: row.try_get("idempotency_key")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_instant(row.try_get("created_at")?)?,
        updated_at: parse_instant(row.try_get("updated_at")?)?,
    })
}

fn parse_instant(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("invalid stored timestamp {s:?}: {e}")))
}

/// Inserts one outbox row. Callers are expected to call this inside the
/// same transaction as the domain write it documents.
pub async fn insert_outbox(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    entry: &NewOutboxRow,
    now: DateTime<Utc>,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO outbox (entity_type, entity_id, operation, payload_json, idempotency_key, attempts, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(entry.entity_type.as_str())
    .bind(&entry.entity_id)
    .bind(entry.operation.as_str())
    .bind(&entry.payload_json)
    .bind(&entry.idempotency_key)
    .bind(now.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

/// Overwrites the idempotency key of an already-inserted row, used when the
/// caller wants it derived from the row's own autoincrement id.
pub async fn set_idempotency_key(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    id: i64,
    key: &str,
) -> Result<()> {
    sqlx::query("UPDATE outbox SET idempotency_key = ? WHERE id = ?")
        .bind(key)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Lists outbox rows in creation order.
pub async fn list_outbox(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, limit: u32) -> Result<Vec<OutboxRow>> {
    let rows = sqlx::query("SELECT * FROM outbox ORDER BY created_at ASC, id ASC LIMIT ?")
        .bind(limit)
        .fetch_all(executor)
        .await?;
    rows.iter().map(row_to_outbox).collect()
}

pub async fn remove_outbox(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    // SQLite has no array binding; build the placeholder list explicitly.
    let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!("DELETE FROM outbox WHERE id IN ({placeholders})");
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    query.execute(executor).await?;
    Ok(())
}

pub async fn mark_outbox_failed(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: i64, reason: &str, now: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE outbox
        SET attempts = attempts + 1,
            last_error = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(reason)
    .bind(now.to_rfc3339())
    .bind(id)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn outbox_len(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<i64> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM outbox").fetch_one(executor).await?;
    Ok(count.0)
}

/// Upserts a tombstone for `(entity_type, entity_id)`.
pub async fn upsert_tombstone(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    entity_type: EntityType,
    entity_id: &str,
    deleted_at: DateTime<Utc>,
    deleted_by_device: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO deleted_records (entity_type, entity_id, deleted_at, deleted_by_device)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            deleted_at = excluded.deleted_at,
            deleted_by_device = excluded.deleted_by_device
        "#,
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(deleted_at.to_rfc3339())
    .bind(deleted_by_device)
    .execute(executor)
    .await?;
    Ok(())
}

/// Clears a tombstone once an UPSERT for the same id is applied.
pub async fn clear_tombstone(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, entity_type: EntityType, entity_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM deleted_records WHERE entity_type = ? AND entity_id = ?")
        .bind(entity_type.as_str())
        .bind(entity_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Reads a tombstone's `(deleted_at, deleted_by_device)`, used when the sync
/// engine needs the shadow of a row that was deleted locally.
pub async fn get_tombstone(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<(DateTime<Utc>, String)>> {
    let row = sqlx::query(
        "SELECT deleted_at, deleted_by_device FROM deleted_records WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .fetch_optional(executor)
    .await?;
    row.map(|r| {
        let deleted_at: String = r.try_get("deleted_at")?;
        let deleted_by_device: String = r.try_get("deleted_by_device")?;
        Ok((parse_instant(deleted_at)?, deleted_by_device))
    })
    .transpose()
}

pub async fn is_tombstoned(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, entity_type: EntityType, entity_id: &str) -> Result<bool> {
    let count: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM deleted_records WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .fetch_one(executor)
    .await?;
    Ok(count.0 > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[tokio::test]
    async fn insert_list_and_remove_outbox_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = insert_outbox(
            store.pool(),
            &NewOutboxRow {
                entity_type: EntityType::Project,
                entity_id: "p1".into(),
                operation: Operation::Upsert,
                payload_json: Some("{}".into()),
                idempotency_key: "d1:1".into(),
            },
            now,
        )
        .await
        .unwrap();

        let rows = list_outbox(store.pool(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);

        remove_outbox(store.pool(), &[id]).await.unwrap();
        assert_eq!(outbox_len(store.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_failed_increments_attempts() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        let id = insert_outbox(
            store.pool(),
            &NewOutboxRow {
                entity_type: EntityType::Task,
                entity_id: "t1".into(),
                operation: Operation::Upsert,
                payload_json: Some("{}".into()),
                idempotency_key: "d1:2".into(),
            },
            now,
        )
        .await
        .unwrap();

        mark_outbox_failed(store.pool(), id, "[CONFLICT] boom", now).await.unwrap();
        let rows = list_outbox(store.pool(), 10).await.unwrap();
        assert_eq!(rows[0].attempts, 1);
        assert_eq!(rows[0].last_error.as_deref(), Some("[CONFLICT] boom"));
    }

    #[tokio::test]
    async fn tombstone_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        upsert_tombstone(store.pool(), EntityType::Task, "t1", now, "D1").await.unwrap();
        assert!(is_tombstoned(store.pool(), EntityType::Task, "t1").await.unwrap());
        clear_tombstone(store.pool(), EntityType::Task, "t1").await.unwrap();
        assert!(!is_tombstoned(store.pool(), EntityType::Task, "t1").await.unwrap());
    }
}

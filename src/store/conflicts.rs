//! store/conflicts.rs - Raw persistence for conflicts and their event audit
//! trail. Business rules (state transitions, retention) live in the
//! `conflict` module; this file is I/O only.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::models::{EntityType, Operation};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
    Ignored,
}

impl ConflictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictStatus::Open => "open",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Ignored => "ignored",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ConflictStatus::Open),
            "resolved" => Some(ConflictStatus::Resolved),
            "ignored" => Some(ConflictStatus::Ignored),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRow {
    pub id: String,
    pub incoming_idempotency_key: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub conflict_type: String,
    pub reason_code: String,
    pub message: String,
    pub local_payload: Option<String>,
    pub remote_payload: Option<String>,
    pub base_payload: Option<String>,
    pub status: ConflictStatus,
    pub resolution_strategy: Option<String>,
    pub resolution_payload: Option<String>,
    pub resolved_by_device: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictEventType {
    Detected,
    Resolved,
    Ignored,
    Retried,
    Exported,
}

impl ConflictEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictEventType::Detected => "detected",
            ConflictEventType::Resolved => "resolved",
            ConflictEventType::Ignored => "ignored",
            ConflictEventType::Retried => "retried",
            ConflictEventType::Exported => "exported",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEventRow {
    pub id: String,
    pub conflict_id: String,
    pub event_type: ConflictEventType,
    pub event_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn parse_instant(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("invalid stored timestamp {s:?}: {e}")))
}

fn row_to_conflict(row: &sqlx::sqlite::SqliteRow) -> Result<ConflictRow> {
    Ok(ConflictRow {
        id: row.try_get("id")?,
        incoming_idempotency_key: row.try_get("incoming_idempotency_key")?,
        entity_type: EntityType::parse(row.try_get::<String, _>("entity_type")?.as_str())
            .ok_or_else(|| Error::Store("invalid entity_type in conflict row".to_string()))?,
        entity_id: row.try_get("entity_id")?,
        operation: Operation::parse(row.try_get::<String, _>("operation")?.as_str())
            .ok_or_else(|| Error::Store("invalid operation in conflict row".to_string()))?,
        conflict_type: row.try_get("conflict_type")?,
        reason_code: row.try_get("reason_code")?,
        message: row.try_get("message")?,
        local_payload: row.try_get("local_payload")?,
        remote_payload: row.try_get("remote_payload")?,
        base_payload: row.try_get("base_payload")?,
        status: ConflictStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .ok_or_else(|| Error::Store("invalid status in conflict row".to_string()))?,
        resolution_strategy: row.try_get("resolution_strategy")?,
        resolution_payload: row.try_get("resolution_payload")?,
        resolved_by_device: row.try_get("resolved_by_device")?,
        detected_at: parse_instant(row.try_get("detected_at")?)?,
        resolved_at: row
            .try_get::<Option<String>, _>("resolved_at")?
            .map(parse_instant)
            .transpose()?,
    })
}

pub async fn insert_conflict(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, row: &ConflictRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conflicts (id, incoming_idempotency_key, entity_type, entity_id, operation,
                               conflict_type, reason_code, message, local_payload, remote_payload,
                               base_payload, status, resolution_strategy, resolution_payload,
                               resolved_by_device, detected_at, resolved_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&row.id)
    .bind(&row.incoming_idempotency_key)
    .bind(row.entity_type.as_str())
    .bind(&row.entity_id)
    .bind(row.operation.as_str())
    .bind(&row.conflict_type)
    .bind(&row.reason_code)
    .bind(&row.message)
    .bind(&row.local_payload)
    .bind(&row.remote_payload)
    .bind(&row.base_payload)
    .bind(row.status.as_str())
    .bind(&row.resolution_strategy)
    .bind(&row.resolution_payload)
    .bind(&row.resolved_by_device)
    .bind(row.detected_at.to_rfc3339())
    .bind(row.resolved_at.map(|t| t.to_rfc3339()))
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_conflict(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<Option<ConflictRow>> {
    let row = sqlx::query("SELECT * FROM conflicts WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_conflict).transpose()
}

pub async fn get_conflict_by_idempotency_key(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    idempotency_key: &str,
) -> Result<Option<ConflictRow>> {
    let row = sqlx::query("SELECT * FROM conflicts WHERE incoming_idempotency_key = ?")
        .bind(idempotency_key)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_conflict).transpose()
}

/// Replaces the mutable fields of an already-persisted conflict (re-open,
/// resolve, ignore transitions).
pub async fn update_conflict(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, row: &ConflictRow) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE conflicts SET
            conflict_type = ?,
            reason_code = ?,
            message = ?,
            local_payload = ?,
            remote_payload = ?,
            base_payload = ?,
            status = ?,
            resolution_strategy = ?,
            resolution_payload = ?,
            resolved_by_device = ?,
            detected_at = ?,
            resolved_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&row.conflict_type)
    .bind(&row.reason_code)
    .bind(&row.message)
    .bind(&row.local_payload)
    .bind(&row.remote_payload)
    .bind(&row.base_payload)
    .bind(row.status.as_str())
    .bind(&row.resolution_strategy)
    .bind(&row.resolution_payload)
    .bind(&row.resolved_by_device)
    .bind(row.detected_at.to_rfc3339())
    .bind(row.resolved_at.map(|t| t.to_rfc3339()))
    .bind(&row.id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Lists conflicts open-first, then resolved, then ignored; within a group
/// most-recent `detected_at` first.
pub async fn list_conflicts(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    status_filter: Option<ConflictStatus>,
    limit: u32,
) -> Result<Vec<ConflictRow>> {
    // Group ordering happens in SQL, ahead of the `LIMIT`, so an unfiltered
    // page can never drop an open conflict in favor of a more-recently
    // detected resolved/ignored one.
    let rows = match status_filter {
        Some(status) => {
            sqlx::query("SELECT * FROM conflicts WHERE status = ? ORDER BY detected_at DESC LIMIT ?")
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(executor)
                .await?
        }
        None => {
            sqlx::query(
                r#"
                SELECT * FROM conflicts
                ORDER BY CASE status
                    WHEN 'open' THEN 0
                    WHEN 'resolved' THEN 1
                    WHEN 'ignored' THEN 2
                    ELSE 3
                END, detected_at DESC
                LIMIT ?
                "#,
            )
            .bind(limit)
            .fetch_all(executor)
            .await?
        }
    };

    rows.iter().map(row_to_conflict).collect()
}

pub async fn insert_conflict_event(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, event: &ConflictEventRow) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO conflict_events (id, conflict_id, event_type, event_payload, created_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(&event.conflict_id)
    .bind(event.event_type.as_str())
    .bind(&event.event_payload)
    .bind(event.created_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<ConflictEventRow> {
    let event_type = match row.try_get::<String, _>("event_type")?.as_str() {
        "detected" => ConflictEventType::Detected,
        "resolved" => ConflictEventType::Resolved,
        "ignored" => ConflictEventType::Ignored,
        "retried" => ConflictEventType::Retried,
        "exported" => ConflictEventType::Exported,
        other => return Err(Error::Store(format!("unknown conflict event type: {other}"))),
    };
    Ok(ConflictEventRow {
        id: row.try_get("id")?,
        conflict_id: row.try_get("conflict_id")?,
        event_type,
        event_payload: row.try_get("event_payload")?,
        created_at: parse_instant(row.try_get("created_at")?)?,
    })
}

pub async fn list_events_for_conflict(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    conflict_id: &str,
    limit: u32,
) -> Result<Vec<ConflictEventRow>> {
    let rows = sqlx::query(
        "SELECT * FROM conflict_events WHERE conflict_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(conflict_id)
    .bind(limit)
    .fetch_all(executor)
    .await?;
    rows.iter().map(row_to_event).collect()
}

pub async fn count_events_for_conflict(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, conflict_id: &str) -> Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conflict_events WHERE conflict_id = ?")
            .bind(conflict_id)
            .fetch_one(executor)
            .await?;
    Ok(count.0)
}

/// Deletes the oldest events for a conflict beyond the per-conflict
/// retention cap.
pub async fn trim_oldest_events_for_conflict(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    conflict_id: &str,
    keep: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM conflict_events
        WHERE conflict_id = ?
        AND id NOT IN (
            SELECT id FROM conflict_events
            WHERE conflict_id = ?
            ORDER BY created_at DESC
            LIMIT ?
        )
        "#,
    )
    .bind(conflict_id)
    .bind(conflict_id)
    .bind(keep)
    .execute(executor)
    .await?;
    Ok(())
}

/// Deletes events older than `cutoff` across all conflicts.
pub async fn prune_events_older_than(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query("DELETE FROM conflict_events WHERE created_at < ?")
        .bind(cutoff.to_rfc3339())
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Observability counters consumed on demand.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConflictCounters {
    pub total: i64,
    pub open: i64,
    pub resolved: i64,
    pub ignored: i64,
    pub retried_events: i64,
    pub exported_events: i64,
    pub resolution_rate_percent: f64,
    pub median_resolution_time_ms: Option<i64>,
    pub latest_detected_at: Option<DateTime<Utc>>,
    pub latest_resolved_at: Option<DateTime<Utc>>,
}

pub async fn compute_counters(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<ConflictCounters> {
    let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts").fetch_one(executor).await?;
    let open: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts WHERE status = 'open'")
        .fetch_one(executor)
        .await?;
    let resolved: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts WHERE status = 'resolved'")
        .fetch_one(executor)
        .await?;
    let ignored: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conflicts WHERE status = 'ignored'")
        .fetch_one(executor)
        .await?;
    let retried_events: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conflict_events WHERE event_type = 'retried'")
            .fetch_one(executor)
            .await?;
    let exported_events: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM conflict_events WHERE event_type = 'exported'")
            .fetch_one(executor)
            .await?;

    let latest_detected: Option<(String,)> =
        sqlx::query_as("SELECT detected_at FROM conflicts ORDER BY detected_at DESC LIMIT 1")
            .fetch_optional(executor)
            .await?;
    let latest_resolved: Option<(String,)> = sqlx::query_as(
        "SELECT resolved_at FROM conflicts WHERE resolved_at IS NOT NULL ORDER BY resolved_at DESC LIMIT 1",
    )
    .fetch_optional(executor)
    .await?;

    let resolution_durations: Vec<(String, String)> = sqlx::query_as(
        "SELECT detected_at, resolved_at FROM conflicts WHERE resolved_at IS NOT NULL",
    )
    .fetch_all(executor)
    .await?;

    let mut millis: Vec<i64> = resolution_durations
        .into_iter()
        .filter_map(|(detected, resolved)| {
            let detected = parse_instant(detected).ok()?;
            let resolved = parse_instant(resolved).ok()?;
            Some((resolved - detected).num_milliseconds().max(0))
        })
        .collect();
    millis.sort_unstable();
    let median_resolution_time_ms = match millis.len() {
        0 => None,
        n if n % 2 == 1 => Some(millis[n / 2]),
        n => Some((millis[n / 2 - 1] + millis[n / 2]) / 2),
    };

    let resolution_rate_percent = if total.0 > 0 {
        (resolved.0 as f64 / total.0 as f64) * 100.0
    } else {
        0.0
    };

    Ok(ConflictCounters {
        total: total.0,
        open: open.0,
        resolved: resolved.0,
        ignored: ignored.0,
        retried_events: retried_events.0,
        exported_events: exported_events.0,
        resolution_rate_percent,
        median_resolution_time_ms,
        latest_detected_at: latest_detected.map(|(s,)| parse_instant(s)).transpose()?,
        latest_resolved_at: latest_resolved.map(|(s,)| parse_instant(s)).transpose()?,
    })
}

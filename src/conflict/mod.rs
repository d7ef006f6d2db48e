//! conflict/mod.rs - Conflict business logic layered over the raw
//! persistence in `store::conflicts`: state transitions, the resolution
//! side-effect settings row, retention, and the host-facing report/listing
//! surface (component C5).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::clock::Clock;
use crate::ids::IdGenerator;
use crate::store::conflicts::{
    self, ConflictCounters, ConflictEventRow, ConflictEventType, ConflictRow, ConflictStatus,
};
use crate::store::models::{EntityType, Operation, Setting};
use crate::store::{entities, outbox, Store};
use crate::wire::SyncChange;
use crate::{Error, Result};

/// Per-conflict event retention cap.
const MAX_EVENTS_PER_CONFLICT: i64 = 200;
/// Global event retention window.
const EVENT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    KeepLocal,
    KeepRemote,
    ManualMerge,
    Retry,
}

impl ResolutionStrategy {
    fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::KeepLocal => "keep_local",
            ResolutionStrategy::KeepRemote => "keep_remote",
            ResolutionStrategy::ManualMerge => "manual_merge",
            ResolutionStrategy::Retry => "retry",
        }
    }
}

/// Lightweight envelope surfaced in a [`crate::engine::PullSummary`] for each
/// conflict raised during a pull, without the full persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictEnvelope {
    pub idempotency_key: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub reason_code: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictReportItem {
    pub conflict: ReportConflict,
    pub events: Vec<ReportEvent>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportConflict {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: String,
    pub reason_code: String,
    pub status: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportEvent {
    pub event_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConflictReport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub total_conflicts: usize,
    pub status_filter: Option<String>,
    pub items: Vec<ConflictReportItem>,
}

/// Host-facing conflict surface: listing, resolution, export, counters.
pub struct ConflictApi {
    store: Store,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl ConflictApi {
    pub fn new(store: Store, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    pub async fn list_conflicts(
        &self,
        status_filter: Option<ConflictStatus>,
        limit: u32,
    ) -> Result<Vec<ConflictRow>> {
        conflicts::list_conflicts(self.store.pool(), status_filter, limit).await
    }

    pub async fn counters(&self) -> Result<ConflictCounters> {
        conflicts::compute_counters(self.store.pool()).await
    }

    /// Applies a human resolution decision. `retry` leaves the conflict
    /// open (it asks the next cycle to try the incoming change again) and
    /// appends a `retried` event; every other strategy moves it to
    /// `resolved` and appends a `resolved` event. Every strategy writes a
    /// resolution-marker setting and enqueues it for sync, so peers learn a
    /// human acted even though the marker itself isn't user data.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        resolution_payload: Option<Value>,
        resolved_by_device: &str,
    ) -> Result<ConflictRow> {
        if strategy == ResolutionStrategy::ManualMerge {
            match &resolution_payload {
                Some(Value::Object(map)) if !map.is_empty() => {}
                _ => return Err(Error::Validation("MANUAL_MERGE_PAYLOAD_REQUIRED".into())),
            }
        }

        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        let mut row = conflicts::get_conflict(&mut *tx, conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conflict {conflict_id}")))?;

        row.resolution_strategy = Some(strategy.as_str().to_string());
        row.resolution_payload = resolution_payload.as_ref().map(|v| v.to_string());
        row.resolved_by_device = Some(resolved_by_device.to_string());
        if strategy != ResolutionStrategy::Retry {
            row.status = ConflictStatus::Resolved;
            row.resolved_at = Some(now);
        }
        conflicts::update_conflict(&mut *tx, &row).await?;

        let event_type = if strategy == ResolutionStrategy::Retry {
            ConflictEventType::Retried
        } else {
            ConflictEventType::Resolved
        };
        append_event(
            &mut tx,
            &self.ids,
            conflict_id,
            event_type,
            Some(serde_json::json!({"strategy": strategy.as_str()})),
            now,
        )
        .await?;

        self.emit_resolution_marker(&mut tx, &row, strategy, resolved_by_device, now)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Writes `sync.conflict_resolution.<id>` and enqueues it for sync. This
    /// key deliberately falls outside the `local.` namespace and the
    /// device-id key: peers need to observe that a human resolved a
    /// conflict, so it must travel over the wire like any other setting.
    async fn emit_resolution_marker(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        conflict: &ConflictRow,
        strategy: ResolutionStrategy,
        resolved_by_device: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let key = format!("sync.conflict_resolution.{}", conflict.id);
        let value = serde_json::json!({
            "strategy": strategy.as_str(),
            "resolved_by_device": resolved_by_device,
            "resolution_payload": conflict.resolution_payload,
        })
        .to_string();
        entities::upsert_setting(&mut **tx, &Setting { key: key.clone(), value: value.clone() })
            .await?;

        let device_id = self.store.device_id(self.ids.as_ref()).await?;
        let placeholder = self.ids.new_id();
        let row_id = outbox::insert_outbox(
            &mut **tx,
            &outbox::NewOutboxRow {
                entity_type: EntityType::Setting,
                entity_id: key,
                operation: Operation::Upsert,
                payload_json: Some(serde_json::json!({"value": value}).to_string()),
                idempotency_key: placeholder,
            },
            now,
        )
        .await?;
        let derived = crate::ids::derive_idempotency_key(
            &device_id,
            &format!("{}:{}", conflict.id, strategy.as_str()),
        );
        outbox::set_idempotency_key(&mut **tx, row_id, &derived).await?;
        Ok(())
    }

    pub async fn export_report(
        &self,
        status_filter: Option<ConflictStatus>,
        limit: u32,
        events_per_conflict: u32,
    ) -> Result<ConflictReport> {
        let now = self.clock.now();
        let rows = conflicts::list_conflicts(self.store.pool(), status_filter, limit).await?;

        let mut items = Vec::with_capacity(rows.len());
        let mut tx = self.store.pool().begin().await?;
        for row in &rows {
            let events = conflicts::list_events_for_conflict(&mut *tx, &row.id, events_per_conflict)
                .await?;
            append_event(
                &mut tx,
                &self.ids,
                &row.id,
                ConflictEventType::Exported,
                None,
                now,
            )
            .await?;
            items.push(ConflictReportItem {
                conflict: ReportConflict {
                    id: row.id.clone(),
                    entity_type: row.entity_type.as_str().to_string(),
                    entity_id: row.entity_id.clone(),
                    operation: row.operation.as_str().to_string(),
                    reason_code: row.reason_code.clone(),
                    status: row.status.as_str().to_string(),
                    detected_at: row.detected_at,
                    resolved_at: row.resolved_at,
                },
                events: events
                    .into_iter()
                    .map(|e| ReportEvent { event_type: e.event_type.as_str().to_string(), created_at: e.created_at })
                    .collect(),
            });
        }
        tx.commit().await?;

        Ok(ConflictReport {
            version: 1,
            exported_at: now,
            total_conflicts: items.len(),
            status_filter: status_filter.map(|s| s.as_str().to_string()),
            items,
        })
    }
}

/// Appends an event, enforcing the per-conflict cap and the global
/// retention window in the same call.
async fn append_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ids: &Arc<dyn IdGenerator>,
    conflict_id: &str,
    event_type: ConflictEventType,
    payload: Option<Value>,
    now: DateTime<Utc>,
) -> Result<()> {
    conflicts::insert_conflict_event(
        &mut **tx,
        &ConflictEventRow {
            id: ids.new_id(),
            conflict_id: conflict_id.to_string(),
            event_type,
            event_payload: payload.map(|p| p.to_string()),
            created_at: now,
        },
    )
    .await?;
    conflicts::trim_oldest_events_for_conflict(&mut **tx, conflict_id, MAX_EVENTS_PER_CONFLICT).await?;
    let cutoff = now - chrono::Duration::days(EVENT_RETENTION_DAYS);
    conflicts::prune_events_older_than(&mut **tx, cutoff).await?;
    Ok(())
}

/// Inserts or re-opens a conflict keyed by `incoming_idempotency_key` and
/// appends a `detected` event. Called from inside the sync engine's own
/// per-change transaction.
pub async fn record_conflict(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ids: &Arc<dyn IdGenerator>,
    change: &SyncChange,
    reason_code: &str,
    message: &str,
    local_payload: Option<String>,
    now: DateTime<Utc>,
) -> Result<ConflictRow> {
    let existing = conflicts::get_conflict_by_idempotency_key(&mut **tx, &change.idempotency_key).await?;

    let row = match existing {
        Some(mut row) => {
            row.status = ConflictStatus::Open;
            row.reason_code = reason_code.to_string();
            row.message = message.to_string();
            row.local_payload = local_payload;
            row.remote_payload = Some(change.payload.to_string());
            row.resolved_at = None;
            conflicts::update_conflict(&mut **tx, &row).await?;
            row
        }
        None => {
            let row = ConflictRow {
                id: ids.new_id(),
                incoming_idempotency_key: change.idempotency_key.clone(),
                entity_type: change.entity_type,
                entity_id: change.entity_id.clone(),
                operation: change.operation,
                conflict_type: "VALIDATION".to_string(),
                reason_code: reason_code.to_string(),
                message: message.to_string(),
                local_payload,
                remote_payload: Some(change.payload.to_string()),
                base_payload: None,
                status: ConflictStatus::Open,
                resolution_strategy: None,
                resolution_payload: None,
                resolved_by_device: None,
                detected_at: now,
                resolved_at: None,
            };
            conflicts::insert_conflict(&mut **tx, &row).await?;
            row
        }
    };

    append_event(tx, ids, &row.id, ConflictEventType::Detected, None, now).await?;
    Ok(row)
}

/// When an incoming change's `idempotency_key` matches an **open** conflict,
/// and that change was just applied successfully, the conflict resolves
/// itself: the retry the human asked for worked.
pub async fn try_auto_resolve_by_retry(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ids: &Arc<dyn IdGenerator>,
    idempotency_key: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(mut row) = conflicts::get_conflict_by_idempotency_key(&mut **tx, idempotency_key).await? else {
        return Ok(false);
    };
    if row.status != ConflictStatus::Open {
        return Ok(false);
    }
    row.status = ConflictStatus::Resolved;
    row.resolution_strategy = Some(ResolutionStrategy::Retry.as_str().to_string());
    row.resolved_at = Some(now);
    conflicts::update_conflict(&mut **tx, &row).await?;
    append_event(tx, ids, &row.id, ConflictEventType::Resolved, None, now).await?;
    Ok(true)
}

/// If the incoming change's key belongs to an already-terminal (`resolved`
/// or `ignored`) conflict, it is not re-raised: record a `retried` event and
/// tell the caller to treat the change as `Skipped`.
pub async fn record_repeat_receipt(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ids: &Arc<dyn IdGenerator>,
    idempotency_key: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(row) = conflicts::get_conflict_by_idempotency_key(&mut **tx, idempotency_key).await? else {
        return Ok(false);
    };
    if row.status == ConflictStatus::Open {
        return Ok(false);
    }
    append_event(tx, ids, &row.id, ConflictEventType::Retried, None, now).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::SequentialIdGenerator;
    use crate::store::models::Operation;
    use serde_json::json;

    fn change(key: &str) -> SyncChange {
        SyncChange {
            entity_type: EntityType::Task,
            entity_id: "t1".into(),
            operation: Operation::Upsert,
            updated_at: Utc::now(),
            updated_by_device: "D2".into(),
            sync_version: 2,
            payload: json!({"title": ""}),
            idempotency_key: key.into(),
        }
    }

    async fn harness() -> (Store, Arc<dyn IdGenerator>) {
        (Store::open_in_memory().await.unwrap(), Arc::new(SequentialIdGenerator::new("c")))
    }

    #[tokio::test]
    async fn record_conflict_then_auto_resolve_by_retry() {
        let (store, ids) = harness().await;
        let now = Utc::now();
        let mut tx = store.pool().begin().await.unwrap();
        let row = record_conflict(&mut tx, &ids, &change("k1"), "MISSING_TASK_TITLE", "title required", None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(row.status, ConflictStatus::Open);

        let mut tx = store.pool().begin().await.unwrap();
        let resolved = try_auto_resolve_by_retry(&mut tx, &ids, "k1", now).await.unwrap();
        tx.commit().await.unwrap();
        assert!(resolved);

        let reloaded = conflicts::get_conflict(store.pool(), &row.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, ConflictStatus::Resolved);
        assert_eq!(reloaded.resolution_strategy.as_deref(), Some("retry"));
    }

    #[tokio::test]
    async fn repeat_receipt_on_resolved_conflict_is_recorded_not_reraised() {
        let (store, ids) = harness().await;
        let now = Utc::now();
        let mut tx = store.pool().begin().await.unwrap();
        let row = record_conflict(&mut tx, &ids, &change("k2"), "MISSING_TASK_TITLE", "title required", None, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.pool().begin().await.unwrap();
        try_auto_resolve_by_retry(&mut tx, &ids, "k2", now).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.pool().begin().await.unwrap();
        let repeat = record_repeat_receipt(&mut tx, &ids, "k2", now).await.unwrap();
        tx.commit().await.unwrap();
        assert!(repeat);

        let events = conflicts::list_events_for_conflict(store.pool(), &row.id, 10).await.unwrap();
        assert!(events.iter().any(|e| e.event_type == ConflictEventType::Retried));
    }

    #[tokio::test]
    async fn resolve_requires_nonempty_payload_for_manual_merge() {
        let (store, ids) = harness().await;
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let api = ConflictApi::new(store.clone(), clock, ids.clone());
        let mut tx = store.pool().begin().await.unwrap();
        let row = record_conflict(&mut tx, &ids, &change("k3"), "MISSING_TASK_TITLE", "title required", None, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = api
            .resolve(&row.id, ResolutionStrategy::ManualMerge, None, "D1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "MANUAL_MERGE_PAYLOAD_REQUIRED"));
    }

    #[tokio::test]
    async fn resolve_keep_local_closes_conflict_and_emits_marker_outbox_row() {
        let (store, ids) = harness().await;
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let api = ConflictApi::new(store.clone(), clock, ids.clone());
        let mut tx = store.pool().begin().await.unwrap();
        let row = record_conflict(&mut tx, &ids, &change("k4"), "MISSING_TASK_TITLE", "title required", None, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let resolved = api
            .resolve(&row.id, ResolutionStrategy::KeepLocal, None, "D1")
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);

        let outbox_rows = outbox::list_outbox(store.pool(), 10).await.unwrap();
        assert_eq!(outbox_rows.len(), 1);
        assert_eq!(outbox_rows[0].entity_type, EntityType::Setting);
        assert!(outbox_rows[0].entity_id.starts_with("sync.conflict_resolution."));
    }

    #[tokio::test]
    async fn resolve_retry_leaves_conflict_open() {
        let (store, ids) = harness().await;
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let api = ConflictApi::new(store.clone(), clock, ids.clone());
        let mut tx = store.pool().begin().await.unwrap();
        let row = record_conflict(&mut tx, &ids, &change("k5"), "MISSING_TASK_TITLE", "title required", None, Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let resolved = api
            .resolve(&row.id, ResolutionStrategy::Retry, None, "D1")
            .await
            .unwrap();
        assert_eq!(resolved.status, ConflictStatus::Open);
    }
}

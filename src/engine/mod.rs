//! engine/mod.rs - Merge core: turns outbox rows into a push request,
//! reconciles a push response against the outbox, and applies an incoming
//! pull response with last-writer-wins merge and conflict classification
//! (component C4).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::clock::Clock;
use crate::ids::IdGenerator;
use crate::store::models::{is_local_only_key, EntityType, Operation, SyncShadow};
use crate::store::{checkpoint, entities, outbox, Store};
use crate::wire::payload::{ProjectPayload, SettingPayload, TaskPayload, TaskSubtaskPayload, TaskTemplatePayload};
use crate::wire::{sort_changes, PullResponse, PushRequest, PushResponse, RejectReason, SyncChange};
use crate::{conflict, Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedOutboxEntry {
    pub outbox_id: i64,
    pub reason_code: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedBatch {
    pub request: PushRequest,
    /// `(outbox_id, idempotency_key)` pairs for every change in the batch,
    /// in the same order `acknowledge_push` needs to reconcile them.
    pub entries: Vec<(i64, String)>,
    pub skipped: Vec<SkippedOutboxEntry>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PushSummary {
    pub removed_ids: Vec<i64>,
    pub failed_ids: Vec<i64>,
    pub pending_ids: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    Skipped,
    Conflict { reason_code: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullSummary {
    pub applied: u32,
    pub skipped: u32,
    pub skipped_self: u32,
    pub failed: u32,
    pub conflicts: Vec<conflict::ConflictEnvelope>,
}

pub struct SyncEngine {
    store: Store,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl SyncEngine {
    pub fn new(store: Store, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    /// Reads up to `max` outbox rows in creation order and turns them into a
    /// sorted, ready-to-send [`PushRequest`].
    pub async fn prepare_push(
        &self,
        device_id: &str,
        base_cursor: Option<String>,
        max: u32,
    ) -> Result<PreparedBatch> {
        let rows = outbox::list_outbox(self.store.pool(), max).await?;
        let mut changes = Vec::with_capacity(rows.len());
        let mut entries = Vec::with_capacity(rows.len());
        let mut skipped = Vec::new();

        for row in rows {
            if row.entity_id.is_empty() {
                skipped.push(SkippedOutboxEntry { outbox_id: row.id, reason_code: "MISSING_ENTITY_ID".into() });
                continue;
            }

            let payload = match (row.operation, &row.payload_json) {
                (Operation::Delete, None) => Value::Null,
                (Operation::Delete, Some(_)) => {
                    skipped.push(SkippedOutboxEntry { outbox_id: row.id, reason_code: "INVALID_PAYLOAD".into() });
                    continue;
                }
                (Operation::Upsert, Some(raw)) => match serde_json::from_str::<Value>(raw) {
                    Ok(Value::Object(map)) => Value::Object(map),
                    Ok(_) => {
                        skipped.push(SkippedOutboxEntry { outbox_id: row.id, reason_code: "INVALID_PAYLOAD".into() });
                        continue;
                    }
                    Err(_) => {
                        skipped.push(SkippedOutboxEntry { outbox_id: row.id, reason_code: "INVALID_PAYLOAD_JSON".into() });
                        continue;
                    }
                },
                (Operation::Upsert, None) => {
                    skipped.push(SkippedOutboxEntry { outbox_id: row.id, reason_code: "INVALID_PAYLOAD".into() });
                    continue;
                }
            };

            let shadow = self.current_shadow(row.entity_type, &row.entity_id, device_id, row.created_at).await?;

            let idempotency_key = if row.idempotency_key.is_empty() {
                crate::ids::derive_idempotency_key(device_id, &row.id.to_string())
            } else {
                row.idempotency_key.clone()
            };

            changes.push(SyncChange {
                entity_type: row.entity_type,
                entity_id: row.entity_id.clone(),
                operation: row.operation,
                updated_at: shadow.updated_at,
                updated_by_device: shadow.updated_by_device,
                sync_version: shadow.sync_version,
                payload,
                idempotency_key: idempotency_key.clone(),
            });
            entries.push((row.id, idempotency_key));
        }

        sort_changes(&mut changes);

        Ok(PreparedBatch {
            request: PushRequest {
                schema_version: crate::wire::SCHEMA_VERSION,
                device_id: device_id.to_string(),
                base_cursor,
                changes,
            },
            entries,
            skipped,
        })
    }

    /// The current sync-shadow for an entity: the live row if it still
    /// exists, else its tombstone, else a fallback built from the outbox
    /// row's own bookkeeping timestamp (covers settings, which carry no
    /// shadow columns of their own).
    async fn current_shadow(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        device_id: &str,
        fallback_at: DateTime<Utc>,
    ) -> Result<SyncShadow> {
        if let Some(shadow) = entities::get_existing_shadow(self.store.pool(), entity_type, entity_id).await? {
            return Ok(shadow);
        }
        if let Some((deleted_at, deleted_by_device)) =
            outbox::get_tombstone(self.store.pool(), entity_type, entity_id).await?
        {
            return Ok(SyncShadow { updated_at: deleted_at, updated_by_device: deleted_by_device, sync_version: 1 });
        }
        Ok(SyncShadow { updated_at: fallback_at, updated_by_device: device_id.to_string(), sync_version: 1 })
    }

    /// Reconciles a push response against the outbox: accepted rows are
    /// removed, rejected rows are marked failed, everything else stays
    /// pending for the next cycle.
    pub async fn acknowledge_push(
        &self,
        entries: &[(i64, String)],
        response: &PushResponse,
    ) -> Result<PushSummary> {
        let now = self.clock.now();
        let accepted: std::collections::HashSet<&str> = response.accepted.iter().map(String::as_str).collect();
        let rejected: std::collections::HashMap<&str, &crate::wire::RejectedChange> =
            response.rejected.iter().map(|r| (r.idempotency_key.as_str(), r)).collect();

        let mut summary = PushSummary::default();
        for (outbox_id, key) in entries {
            if accepted.contains(key.as_str()) {
                outbox::remove_outbox(self.store.pool(), &[*outbox_id]).await?;
                summary.removed_ids.push(*outbox_id);
            } else if let Some(rejection) = rejected.get(key.as_str()) {
                let reason = reject_reason_str(rejection.reason);
                outbox::mark_outbox_failed(
                    self.store.pool(),
                    *outbox_id,
                    &format!("[{reason}] {}", rejection.message),
                    now,
                )
                .await?;
                summary.failed_ids.push(*outbox_id);
            } else {
                summary.pending_ids.push(*outbox_id);
            }
        }
        Ok(summary)
    }

    /// Requires a non-empty cursor; writes it to the checkpoint atomically.
    pub async fn advance_cursor(&self, server_cursor: &str, server_time: &str) -> Result<()> {
        if server_cursor.is_empty() {
            return Err(Error::Validation("SERVER_CURSOR_REQUIRED".into()));
        }
        let synced_at = DateTime::parse_from_rfc3339(server_time)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| self.clock.now());
        checkpoint::set_checkpoint(self.store.pool(), Some(server_cursor), Some(synced_at)).await?;
        Ok(())
    }

    /// Sorts, deduplicates by `idempotency_key` (first wins), skips
    /// self-echoes, and applies every remaining change in its own
    /// transaction so a mid-batch failure leaves earlier changes committed.
    pub async fn apply_pull(&self, response: &PullResponse, local_device_id: &str) -> Result<PullSummary> {
        let mut changes = response.changes.clone();
        sort_changes(&mut changes);

        let mut seen = std::collections::HashSet::new();
        let mut deduped = Vec::with_capacity(changes.len());
        for change in changes {
            if seen.insert(change.idempotency_key.clone()) {
                deduped.push(change);
            }
        }

        let mut summary = PullSummary::default();
        for change in &deduped {
            if change.updated_by_device.eq_ignore_ascii_case(local_device_id) {
                summary.skipped_self += 1;
                continue;
            }

            match self.apply_one_change(local_device_id, change).await {
                Ok(ApplyOutcome::Applied) => summary.applied += 1,
                Ok(ApplyOutcome::Skipped) => summary.skipped += 1,
                Ok(ApplyOutcome::Conflict { reason_code }) => {
                    summary.conflicts.push(conflict::ConflictEnvelope {
                        idempotency_key: change.idempotency_key.clone(),
                        entity_type: change.entity_type,
                        entity_id: change.entity_id.clone(),
                        reason_code,
                    });
                }
                Err(_) => summary.failed += 1,
            }
        }
        Ok(summary)
    }

    async fn apply_one_change(&self, local_device_id: &str, change: &SyncChange) -> Result<ApplyOutcome> {
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        if conflict::record_repeat_receipt(&mut tx, &self.ids, &change.idempotency_key, now).await? {
            tx.commit().await?;
            return Ok(ApplyOutcome::Skipped);
        }

        if change.entity_type == EntityType::Setting && is_local_only_key(&change.entity_id) {
            tx.commit().await?;
            return Ok(ApplyOutcome::Skipped);
        }

        let existing_shadow = entities::get_existing_shadow(&mut *tx, change.entity_type, &change.entity_id).await?;
        if let Some(ref existing) = existing_shadow {
            let newer = change.updated_at > existing.updated_at
                || (change.updated_at == existing.updated_at
                    && change.updated_by_device.to_lowercase() >= existing.updated_by_device.to_lowercase());
            if !newer {
                tx.commit().await?;
                return Ok(ApplyOutcome::Skipped);
            }
        }

        if change.operation == Operation::Upsert {
            if let Some(reason_code) = self.validate_incoming(&mut tx, change).await? {
                let local_payload = self.local_payload_snapshot(&mut tx, change).await?;
                conflict::record_conflict(
                    &mut tx,
                    &self.ids,
                    change,
                    &reason_code,
                    &format!("rejected incoming {} {}: {reason_code}", change.entity_type, change.entity_id),
                    local_payload,
                    now,
                )
                .await?;
                tx.commit().await?;
                return Ok(ApplyOutcome::Conflict { reason_code });
            }
        }

        self.apply_write(&mut tx, change, local_device_id).await?;
        conflict::try_auto_resolve_by_retry(&mut tx, &self.ids, &change.idempotency_key, now).await?;

        tx.commit().await?;
        Ok(ApplyOutcome::Applied)
    }

    async fn local_payload_snapshot(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        change: &SyncChange,
    ) -> Result<Option<String>> {
        let value = match change.entity_type {
            EntityType::Project => entities::get_project(&mut **tx, &change.entity_id)
                .await?
                .map(|p| serde_json::to_string(&ProjectPayload::from(&p))),
            EntityType::Task => entities::get_task(&mut **tx, &change.entity_id)
                .await?
                .map(|t| serde_json::to_string(&TaskPayload::from(&t))),
            EntityType::TaskSubtask => entities::get_subtask(&mut **tx, &change.entity_id)
                .await?
                .map(|s| serde_json::to_string(&TaskSubtaskPayload::from(&s))),
            EntityType::TaskTemplate => entities::get_template(&mut **tx, &change.entity_id)
                .await?
                .map(|t| serde_json::to_string(&TaskTemplatePayload::from(&t))),
            EntityType::Setting => None,
        };
        value.transpose().map_err(Error::from)
    }

    /// Validation conflicts for an incoming UPSERT (§4.4.5 step 3). Returns
    /// the reason code when the change must be rejected without applying.
    async fn validate_incoming(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        change: &SyncChange,
    ) -> Result<Option<String>> {
        match change.entity_type {
            EntityType::Project => {
                let payload = match ProjectPayload::parse(&change.payload) {
                    Ok(p) => p,
                    Err(_) => return Ok(Some("MISSING_PROJECT_NAME".into())),
                };
                if payload.name.trim().is_empty() {
                    return Ok(Some("MISSING_PROJECT_NAME".into()));
                }
            }
            EntityType::Task => {
                let payload = match TaskPayload::parse(&change.payload) {
                    Ok(p) => p,
                    Err(_) => return Ok(Some("MISSING_TASK_TITLE".into())),
                };
                if payload.title.trim().is_empty() {
                    return Ok(Some("MISSING_TASK_TITLE".into()));
                }
                if let Some(project_id) = &payload.project_id {
                    if entities::get_project(&mut **tx, project_id).await?.is_none() {
                        return Ok(Some("TASK_PROJECT_NOT_FOUND".into()));
                    }
                }
                if let Some(existing) = entities::get_task(&mut **tx, &change.entity_id).await? {
                    if let (Some(incoming_notes), Some(existing_notes)) =
                        (&payload.notes_markdown, &existing.notes_markdown)
                    {
                        if incoming_notes != existing_notes
                            && !existing.shadow.updated_by_device.eq_ignore_ascii_case(&change.updated_by_device)
                        {
                            return Ok(Some("TASK_NOTES_COLLISION".into()));
                        }
                    }
                }
            }
            EntityType::TaskSubtask => {
                let payload = match TaskSubtaskPayload::parse(&change.payload) {
                    Ok(p) => p,
                    Err(_) => return Ok(Some("INVALID_SUBTASK_PAYLOAD".into())),
                };
                if payload.title.trim().is_empty() {
                    return Ok(Some("INVALID_SUBTASK_PAYLOAD".into()));
                }
                if entities::get_task(&mut **tx, &payload.task_id).await?.is_none() {
                    return Ok(Some("SUBTASK_TASK_NOT_FOUND".into()));
                }
            }
            EntityType::TaskTemplate => {
                let payload = match TaskTemplatePayload::parse(&change.payload) {
                    Ok(p) => p,
                    Err(_) => return Ok(Some("MISSING_TEMPLATE_NAME".into())),
                };
                if payload.name.trim().is_empty() {
                    return Ok(Some("MISSING_TEMPLATE_NAME".into()));
                }
            }
            EntityType::Setting => {}
        }
        Ok(None)
    }

    async fn apply_write(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        change: &SyncChange,
        _local_device_id: &str,
    ) -> Result<()> {
        match change.operation {
            Operation::Delete => {
                entities::delete_entity(&mut **tx, change.entity_type, &change.entity_id).await?;
                outbox::upsert_tombstone(
                    &mut **tx,
                    change.entity_type,
                    &change.entity_id,
                    change.updated_at,
                    &change.updated_by_device,
                )
                .await?;
            }
            Operation::Upsert => {
                let shadow = SyncShadow {
                    updated_at: change.updated_at,
                    updated_by_device: change.updated_by_device.clone(),
                    sync_version: change.sync_version,
                };
                self.upsert_from_wire(tx, change, shadow).await?;
                outbox::clear_tombstone(&mut **tx, change.entity_type, &change.entity_id).await?;
            }
        }
        Ok(())
    }

    async fn upsert_from_wire(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        change: &SyncChange,
        shadow: SyncShadow,
    ) -> Result<()> {
        match change.entity_type {
            EntityType::Project => {
                let p = ProjectPayload::parse(&change.payload)?;
                entities::upsert_project(
                    &mut **tx,
                    &crate::store::models::Project {
                        id: change.entity_id.clone(),
                        name: p.name,
                        description: p.description,
                        color: p.color,
                        status: p.status,
                        created_at: p.created_at,
                        shadow,
                    },
                )
                .await
            }
            EntityType::Task => {
                let t = TaskPayload::parse(&change.payload)?;
                entities::upsert_task(
                    &mut **tx,
                    &crate::store::models::Task {
                        id: change.entity_id.clone(),
                        title: t.title,
                        description: t.description,
                        notes_markdown: t.notes_markdown,
                        project_id: t.project_id,
                        status: t.status,
                        priority: t.priority,
                        is_important: t.is_important,
                        due_at: t.due_at,
                        remind_at: t.remind_at,
                        recurrence: t.recurrence,
                        created_at: t.created_at,
                        shadow,
                    },
                )
                .await
            }
            EntityType::TaskSubtask => {
                let s = TaskSubtaskPayload::parse(&change.payload)?;
                entities::upsert_subtask(
                    &mut **tx,
                    &crate::store::models::TaskSubtask {
                        id: change.entity_id.clone(),
                        task_id: s.task_id,
                        title: s.title,
                        is_done: s.is_done,
                        created_at: s.created_at,
                        shadow,
                    },
                )
                .await
            }
            EntityType::TaskTemplate => {
                let t = TaskTemplatePayload::parse(&change.payload)?;
                entities::upsert_template(
                    &mut **tx,
                    &crate::store::models::TaskTemplate {
                        id: change.entity_id.clone(),
                        name: t.name,
                        title_template: t.title_template,
                        description: t.description,
                        priority: t.priority,
                        is_important: t.is_important,
                        due_offset_minutes: t.due_offset_minutes,
                        remind_offset_minutes: t.remind_offset_minutes,
                        recurrence: t.recurrence,
                        created_at: t.created_at,
                        shadow,
                    },
                )
                .await
            }
            EntityType::Setting => {
                let s = SettingPayload::parse(&change.payload)?;
                entities::upsert_setting(
                    &mut **tx,
                    &crate::store::models::Setting { key: change.entity_id.clone(), value: s.value },
                )
                .await
            }
        }
    }
}

fn reject_reason_str(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::Conflict => "CONFLICT",
        RejectReason::InvalidPayload => "INVALID_PAYLOAD",
        RejectReason::RateLimited => "RATE_LIMITED",
        RejectReason::InternalError => "INTERNAL_ERROR",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::SequentialIdGenerator;
    use crate::mutation::{MutationApi, NewProjectInput, NewTaskInput};
    use crate::store::models::ProjectStatus;
    use crate::wire::{PullResponse, PushResponse, RejectedChange};
    use serde_json::json;

    #[tokio::test]
    async fn prepare_push_sorts_and_skips_empty_entity_id() {
        let store = Store::open_in_memory().await.unwrap();
        let now = Utc::now();
        outbox::insert_outbox(
            store.pool(),
            &outbox::NewOutboxRow {
                entity_type: EntityType::Task,
                entity_id: "".into(),
                operation: Operation::Upsert,
                payload_json: Some("{}".into()),
                idempotency_key: "bad".into(),
            },
            now,
        )
        .await
        .unwrap();

        let clock = Arc::new(FixedClock::new(now));
        let ids = Arc::new(SequentialIdGenerator::new("id"));
        let engine = SyncEngine::new(store, clock, ids);
        let batch = engine.prepare_push("D1", None, 10).await.unwrap();
        assert_eq!(batch.entries.len(), 0);
        assert_eq!(batch.skipped.len(), 1);
        assert_eq!(batch.skipped[0].reason_code, "MISSING_ENTITY_ID");
    }

    #[tokio::test]
    async fn end_to_end_push_then_acknowledge_removes_outbox_row() {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let mutation = MutationApi::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());
        mutation
            .create_project(NewProjectInput { name: "Alpha".into(), ..Default::default() })
            .await
            .unwrap();

        let engine = SyncEngine::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());
        let batch = engine.prepare_push("D1", None, 10).await.unwrap();
        assert_eq!(batch.request.changes.len(), 1);

        let response = PushResponse {
            accepted: vec![batch.entries[0].1.clone()],
            rejected: vec![],
            server_cursor: "c1".into(),
            server_time: "2026-03-01T10:00:01Z".into(),
        };
        let summary = engine.acknowledge_push(&batch.entries, &response).await.unwrap();
        assert_eq!(summary.removed_ids.len(), 1);
        assert_eq!(outbox::outbox_len(store.pool()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn acknowledge_push_marks_rejected_rows_failed() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let mutation = MutationApi::new(store.clone(), clock.clone(), ids.clone());
        mutation
            .create_project(NewProjectInput { name: "Alpha".into(), ..Default::default() })
            .await
            .unwrap();

        let engine = SyncEngine::new(store.clone(), clock.clone(), ids.clone());
        let batch = engine.prepare_push("D1", None, 10).await.unwrap();
        let response = PushResponse {
            accepted: vec![],
            rejected: vec![RejectedChange {
                idempotency_key: batch.entries[0].1.clone(),
                reason: RejectReason::Conflict,
                message: "duplicate name".into(),
            }],
            server_cursor: "c1".into(),
            server_time: "2026-03-01T10:00:01Z".into(),
        };
        let summary = engine.acknowledge_push(&batch.entries, &response).await.unwrap();
        assert_eq!(summary.failed_ids.len(), 1);
        let rows = outbox::list_outbox(store.pool(), 10).await.unwrap();
        assert_eq!(rows[0].attempts, 1);
    }

    #[tokio::test]
    async fn advance_cursor_rejects_empty_cursor() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let engine = SyncEngine::new(store, clock, ids);
        let err = engine.advance_cursor("", "2026-03-01T10:00:00Z").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "SERVER_CURSOR_REQUIRED"));
    }

    #[tokio::test]
    async fn apply_pull_skips_self_echo() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let engine = SyncEngine::new(store, clock, ids);

        let response = PullResponse {
            server_cursor: "c1".into(),
            server_time: "2026-03-01T10:00:00Z".into(),
            has_more: false,
            changes: vec![SyncChange {
                entity_type: EntityType::Project,
                entity_id: "p1".into(),
                operation: Operation::Upsert,
                updated_at: Utc::now(),
                updated_by_device: "D1".into(),
                sync_version: 1,
                payload: json!({"name": "Alpha", "status": "ACTIVE", "created_at": Utc::now()}),
                idempotency_key: "d1:1".into(),
            }],
        };
        let summary = engine.apply_pull(&response, "d1").await.unwrap();
        assert_eq!(summary.skipped_self, 1);
        assert_eq!(summary.applied, 0);
    }

    #[tokio::test]
    async fn apply_pull_rejects_missing_task_title_as_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let engine = SyncEngine::new(store, clock, ids);

        let response = PullResponse {
            server_cursor: "c1".into(),
            server_time: "2026-03-01T10:00:00Z".into(),
            has_more: false,
            changes: vec![SyncChange {
                entity_type: EntityType::Task,
                entity_id: "t1".into(),
                operation: Operation::Upsert,
                updated_at: Utc::now(),
                updated_by_device: "D2".into(),
                sync_version: 1,
                payload: json!({
                    "title": "",
                    "status": "TODO",
                    "priority": "NORMAL",
                    "is_important": false,
                    "recurrence": "NONE",
                    "created_at": Utc::now(),
                }),
                idempotency_key: "d2:1".into(),
            }],
        };
        let summary = engine.apply_pull(&response, "d1").await.unwrap();
        assert_eq!(summary.conflicts.len(), 1);
        assert_eq!(summary.conflicts[0].reason_code, "MISSING_TASK_TITLE");
    }

    #[tokio::test]
    async fn apply_pull_applies_newer_remote_project_upsert() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let engine = SyncEngine::new(store.clone(), clock, ids);

        let response = PullResponse {
            server_cursor: "c1".into(),
            server_time: "2026-03-01T10:00:00Z".into(),
            has_more: false,
            changes: vec![SyncChange {
                entity_type: EntityType::Project,
                entity_id: "p1".into(),
                operation: Operation::Upsert,
                updated_at: Utc::now(),
                updated_by_device: "D2".into(),
                sync_version: 1,
                payload: json!({"name": "Alpha", "status": "ACTIVE", "created_at": Utc::now()}),
                idempotency_key: "d2:1".into(),
            }],
        };
        let summary = engine.apply_pull(&response, "d1").await.unwrap();
        assert_eq!(summary.applied, 1);
        let project = entities::get_project(store.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.name, "Alpha");
        assert_eq!(project.status, ProjectStatus::Active);
    }
}

//! mutation/mod.rs - Local create/update/delete operations (component C2).
//!
//! Every operation here runs inside one `sqlx` transaction: it applies the
//! domain write, bumps the sync-shadow fields, and inserts a matching
//! outbox row (a tombstone too, for deletes) before committing. Nothing
//! about a mutation is visible to a reader until all of that has landed.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::ids::IdGenerator;
use crate::store::models::{
    is_local_only_key, ChangelogAction, EntityType, Operation, Priority, Project, ProjectStatus,
    Recurrence, Setting, SyncShadow, Task, TaskChangelogEntry, TaskStatus, TaskSubtask,
    TaskTemplate,
};
use crate::store::outbox::NewOutboxRow;
use crate::store::{entities, outbox, Store};
use crate::wire::payload::{ProjectPayload, SettingPayload, TaskPayload, TaskSubtaskPayload, TaskTemplatePayload};
use crate::{Error, Result};

/// `Some(None)` clears a nullable field; `Some(Some(v))` sets it; `None`
/// leaves it untouched. Used throughout the `Update*Input` structs below.
pub type Patch<T> = Option<Option<T>>;

fn apply_opt_patch<T: Clone>(current: &Option<T>, patch: Patch<T>) -> Option<T> {
    match patch {
        Some(v) => v,
        None => current.clone(),
    }
}

pub struct MutationApi {
    store: Store,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl MutationApi {
    pub fn new(store: Store, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { store, clock, ids }
    }

    async fn device_id(&self) -> Result<String> {
        self.store.device_id(self.ids.as_ref()).await
    }

    /// Inserts one outbox row inside `tx`, assigning it a deterministic
    /// idempotency key derived from the device id and the row's own
    /// autoincrement id (caller may override before the row is visible to
    /// any reader, since this all happens before commit).
    async fn emit_outbox(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        device_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        operation: Operation,
        payload_json: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let placeholder = self.ids.new_id();
        let row_id = outbox::insert_outbox(
            &mut **tx,
            &NewOutboxRow {
                entity_type,
                entity_id: entity_id.to_string(),
                operation,
                payload_json,
                idempotency_key: placeholder,
            },
            now,
        )
        .await?;
        let key = crate::ids::derive_idempotency_key(device_id, &row_id.to_string());
        outbox::set_idempotency_key(&mut **tx, row_id, &key).await?;
        Ok(row_id)
    }

    // ---- Projects ----------------------------------------------------

    pub async fn create_project(&self, input: NewProjectInput) -> Result<Project> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("PROJECT_NAME_REQUIRED".into()));
        }
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        if entities::project_name_exists(&mut *tx, name, None).await? {
            return Err(Error::ConstraintViolation("PROJECT_NAME_EXISTS".into()));
        }

        let project = Project {
            id: self.ids.new_id(),
            name: name.to_string(),
            description: input.description,
            color: input.color,
            status: ProjectStatus::Active,
            created_at: now,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: 1,
            },
        };
        entities::upsert_project(&mut *tx, &project).await?;

        let payload = serde_json::to_string(&ProjectPayload::from(&project))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::Project,
            &project.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(project)
    }

    pub async fn update_project(&self, id: &str, input: UpdateProjectInput) -> Result<Project> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        let existing = entities::get_project(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {id}")))?;

        let name = input
            .name
            .map(|n| n.trim().to_string())
            .unwrap_or_else(|| existing.name.clone());
        if name.is_empty() {
            return Err(Error::Validation("PROJECT_NAME_REQUIRED".into()));
        }
        if name.to_lowercase() != existing.name.to_lowercase()
            && entities::project_name_exists(&mut *tx, &name, Some(id)).await?
        {
            return Err(Error::ConstraintViolation("PROJECT_NAME_EXISTS".into()));
        }

        let project = Project {
            id: existing.id.clone(),
            name,
            description: apply_opt_patch(&existing.description, input.description),
            color: apply_opt_patch(&existing.color, input.color),
            status: input.status.unwrap_or(existing.status),
            created_at: existing.created_at,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: existing.shadow.sync_version + 1,
            },
        };
        entities::upsert_project(&mut *tx, &project).await?;

        let payload = serde_json::to_string(&ProjectPayload::from(&project))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::Project,
            &project.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(project)
    }

    pub async fn delete_project(&self, id: &str) -> Result<()> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        entities::get_project(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("project {id}")))?;

        entities::delete_project(&mut *tx, id).await?;
        outbox::upsert_tombstone(&mut *tx, EntityType::Project, id, now, &device_id).await?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::Project,
            id,
            Operation::Delete,
            None,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- Tasks ---------------------------------------------------------

    pub async fn create_task(&self, input: NewTaskInput) -> Result<Task> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(Error::Validation("TASK_TITLE_REQUIRED".into()));
        }
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        if let Some(project_id) = &input.project_id {
            if entities::get_project(&mut *tx, project_id).await?.is_none() {
                return Err(Error::Validation("TASK_PROJECT_NOT_FOUND".into()));
            }
        }

        let task = Task {
            id: self.ids.new_id(),
            title: title.to_string(),
            description: input.description,
            notes_markdown: input.notes_markdown,
            project_id: input.project_id,
            status: TaskStatus::Todo,
            priority: input.priority.unwrap_or(Priority::Normal),
            is_important: input.is_important,
            due_at: input.due_at,
            remind_at: input.remind_at,
            recurrence: input.recurrence.unwrap_or(Recurrence::None),
            created_at: now,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: 1,
            },
        };
        entities::upsert_task(&mut *tx, &task).await?;
        self.write_changelog(&mut tx, &task.id, ChangelogAction::Created, None, None, None, now)
            .await?;

        let payload = serde_json::to_string(&TaskPayload::from(&task))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::Task,
            &task.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(task)
    }

    pub async fn update_task(&self, id: &str, input: UpdateTaskInput) -> Result<Task> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        let existing = entities::get_task(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        let title = input
            .title
            .map(|t| t.trim().to_string())
            .unwrap_or_else(|| existing.title.clone());
        if title.is_empty() {
            return Err(Error::Validation("TASK_TITLE_REQUIRED".into()));
        }

        let project_id = apply_opt_patch(&existing.project_id, input.project_id);
        if let Some(pid) = &project_id {
            if entities::get_project(&mut *tx, pid).await?.is_none() {
                return Err(Error::Validation("TASK_PROJECT_NOT_FOUND".into()));
            }
        }

        let new_status = input.status.unwrap_or(existing.status);
        let status_changed = new_status != existing.status;

        let task = Task {
            id: existing.id.clone(),
            title,
            description: apply_opt_patch(&existing.description, input.description),
            notes_markdown: apply_opt_patch(&existing.notes_markdown, input.notes_markdown),
            project_id,
            status: new_status,
            priority: input.priority.unwrap_or(existing.priority),
            is_important: input.is_important.unwrap_or(existing.is_important),
            due_at: apply_opt_patch(&existing.due_at, input.due_at),
            remind_at: apply_opt_patch(&existing.remind_at, input.remind_at),
            recurrence: input.recurrence.unwrap_or(existing.recurrence),
            created_at: existing.created_at,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: existing.shadow.sync_version + 1,
            },
        };

        entities::upsert_task(&mut *tx, &task).await?;

        let action = if status_changed {
            ChangelogAction::StatusChanged
        } else {
            ChangelogAction::Updated
        };
        let (old_value, new_value) = if status_changed {
            (Some(existing.status.as_str().to_string()), Some(task.status.as_str().to_string()))
        } else {
            (None, None)
        };
        self.write_changelog(&mut tx, &task.id, action, Some("status"), old_value, new_value, now)
            .await?;

        let payload = serde_json::to_string(&TaskPayload::from(&task))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::Task,
            &task.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        // Recurring-task rollover: completing a recurring task with a due
        // date spawns the next occurrence, preserving the reminder offset.
        if status_changed
            && task.status == TaskStatus::Done
            && task.recurrence != Recurrence::None
        {
            if let Some(due_at) = task.due_at {
                if let Some(next_due) = task.recurrence.advance(due_at) {
                    let remind_offset = task.remind_at.map(|r| due_at - r);
                    let spawned = Task {
                        id: self.ids.new_id(),
                        title: task.title.clone(),
                        description: task.description.clone(),
                        notes_markdown: None,
                        project_id: task.project_id.clone(),
                        status: TaskStatus::Todo,
                        priority: task.priority,
                        is_important: task.is_important,
                        due_at: Some(next_due),
                        remind_at: remind_offset.map(|offset| next_due - offset),
                        recurrence: task.recurrence,
                        created_at: now,
                        shadow: SyncShadow {
                            updated_at: now,
                            updated_by_device: device_id.clone(),
                            sync_version: 1,
                        },
                    };
                    entities::upsert_task(&mut *tx, &spawned).await?;
                    self.write_changelog(
                        &mut tx,
                        &spawned.id,
                        ChangelogAction::Created,
                        None,
                        None,
                        None,
                        now,
                    )
                    .await?;
                    let spawned_payload = serde_json::to_string(&TaskPayload::from(&spawned))?;
                    self.emit_outbox(
                        &mut tx,
                        &device_id,
                        EntityType::Task,
                        &spawned.id,
                        Operation::Upsert,
                        Some(spawned_payload),
                        now,
                    )
                    .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(task)
    }

    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        entities::get_task(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {id}")))?;

        entities::delete_task(&mut *tx, id).await?;
        outbox::upsert_tombstone(&mut *tx, EntityType::Task, id, now, &device_id).await?;
        self.emit_outbox(&mut tx, &device_id, EntityType::Task, id, Operation::Delete, None, now)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn write_changelog(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_id: &str,
        action: ChangelogAction,
        field_name: Option<&str>,
        old_value: Option<String>,
        new_value: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        entities::insert_changelog(
            &mut **tx,
            &TaskChangelogEntry {
                id: self.ids.new_id(),
                task_id: task_id.to_string(),
                action,
                field_name: field_name.map(str::to_string),
                old_value,
                new_value,
                created_at: now,
            },
        )
        .await
    }

    // ---- Task subtasks --------------------------------------------------

    pub async fn create_subtask(&self, task_id: &str, title: &str) -> Result<TaskSubtask> {
        let title = title.trim();
        if title.is_empty() {
            return Err(Error::Validation("SUBTASK_TITLE_REQUIRED".into()));
        }
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        if entities::get_task(&mut *tx, task_id).await?.is_none() {
            return Err(Error::Validation("SUBTASK_TASK_NOT_FOUND".into()));
        }

        let subtask = TaskSubtask {
            id: self.ids.new_id(),
            task_id: task_id.to_string(),
            title: title.to_string(),
            is_done: false,
            created_at: now,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: 1,
            },
        };
        entities::upsert_subtask(&mut *tx, &subtask).await?;

        let payload = serde_json::to_string(&TaskSubtaskPayload::from(&subtask))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::TaskSubtask,
            &subtask.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(subtask)
    }

    pub async fn update_subtask(
        &self,
        id: &str,
        title: Option<String>,
        is_done: Option<bool>,
    ) -> Result<TaskSubtask> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        let existing = entities::get_subtask(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("subtask {id}")))?;

        let title = title.map(|t| t.trim().to_string()).unwrap_or(existing.title.clone());
        if title.is_empty() {
            return Err(Error::Validation("SUBTASK_TITLE_REQUIRED".into()));
        }

        let subtask = TaskSubtask {
            id: existing.id.clone(),
            task_id: existing.task_id.clone(),
            title,
            is_done: is_done.unwrap_or(existing.is_done),
            created_at: existing.created_at,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: existing.shadow.sync_version + 1,
            },
        };
        entities::upsert_subtask(&mut *tx, &subtask).await?;

        let payload = serde_json::to_string(&TaskSubtaskPayload::from(&subtask))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::TaskSubtask,
            &subtask.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(subtask)
    }

    pub async fn delete_subtask(&self, id: &str) -> Result<()> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        entities::get_subtask(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("subtask {id}")))?;

        entities::delete_subtask(&mut *tx, id).await?;
        outbox::upsert_tombstone(&mut *tx, EntityType::TaskSubtask, id, now, &device_id).await?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::TaskSubtask,
            id,
            Operation::Delete,
            None,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- Task templates --------------------------------------------------

    pub async fn create_template(&self, input: NewTemplateInput) -> Result<TaskTemplate> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("TEMPLATE_NAME_REQUIRED".into()));
        }
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        if entities::template_name_exists(&mut *tx, name, None).await? {
            return Err(Error::ConstraintViolation("TEMPLATE_NAME_EXISTS".into()));
        }

        let template = TaskTemplate {
            id: self.ids.new_id(),
            name: name.to_string(),
            title_template: input.title_template,
            description: input.description,
            priority: input.priority.unwrap_or(Priority::Normal),
            is_important: input.is_important,
            due_offset_minutes: input.due_offset_minutes,
            remind_offset_minutes: input.remind_offset_minutes,
            recurrence: input.recurrence.unwrap_or(Recurrence::None),
            created_at: now,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: 1,
            },
        };
        template
            .validate_offsets()
            .map_err(|e| Error::Validation(e.to_string()))?;

        entities::upsert_template(&mut *tx, &template).await?;

        let payload = serde_json::to_string(&TaskTemplatePayload::from(&template))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::TaskTemplate,
            &template.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(template)
    }

    pub async fn update_template(&self, id: &str, input: UpdateTemplateInput) -> Result<TaskTemplate> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        let existing = entities::get_template(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {id}")))?;

        let name = input.name.map(|n| n.trim().to_string()).unwrap_or(existing.name.clone());
        if name.is_empty() {
            return Err(Error::Validation("TEMPLATE_NAME_REQUIRED".into()));
        }
        if name.to_lowercase() != existing.name.to_lowercase()
            && entities::template_name_exists(&mut *tx, &name, Some(id)).await?
        {
            return Err(Error::ConstraintViolation("TEMPLATE_NAME_EXISTS".into()));
        }

        let template = TaskTemplate {
            id: existing.id.clone(),
            name,
            title_template: apply_opt_patch(&existing.title_template, input.title_template),
            description: apply_opt_patch(&existing.description, input.description),
            priority: input.priority.unwrap_or(existing.priority),
            is_important: input.is_important.unwrap_or(existing.is_important),
            due_offset_minutes: apply_opt_patch(&existing.due_offset_minutes, input.due_offset_minutes),
            remind_offset_minutes: apply_opt_patch(
                &existing.remind_offset_minutes,
                input.remind_offset_minutes,
            ),
            recurrence: input.recurrence.unwrap_or(existing.recurrence),
            created_at: existing.created_at,
            shadow: SyncShadow {
                updated_at: now,
                updated_by_device: device_id.clone(),
                sync_version: existing.shadow.sync_version + 1,
            },
        };
        template
            .validate_offsets()
            .map_err(|e| Error::Validation(e.to_string()))?;

        entities::upsert_template(&mut *tx, &template).await?;

        let payload = serde_json::to_string(&TaskTemplatePayload::from(&template))?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::TaskTemplate,
            &template.id,
            Operation::Upsert,
            Some(payload),
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(template)
    }

    pub async fn delete_template(&self, id: &str) -> Result<()> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        entities::get_template(&mut *tx, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("template {id}")))?;

        entities::delete_template(&mut *tx, id).await?;
        outbox::upsert_tombstone(&mut *tx, EntityType::TaskTemplate, id, now, &device_id).await?;
        self.emit_outbox(
            &mut tx,
            &device_id,
            EntityType::TaskTemplate,
            id,
            Operation::Delete,
            None,
            now,
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- Settings --------------------------------------------------------

    /// Settings are readable regardless of namespace; only the outbox
    /// emission below is gated on `is_local_only_key`.
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        entities::get_setting_raw(self.store.pool(), key).await
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let device_id = self.device_id().await?;
        let now = self.clock.now();
        let mut tx = self.store.pool().begin().await?;

        let setting = Setting {
            key: key.to_string(),
            value: value.to_string(),
        };
        entities::upsert_setting(&mut *tx, &setting).await?;

        if !is_local_only_key(key) {
            let payload = serde_json::to_string(&SettingPayload::from(&setting))?;
            self.emit_outbox(
                &mut tx,
                &device_id,
                EntityType::Setting,
                key,
                Operation::Upsert,
                Some(payload),
                now,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewProjectInput {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProjectInput {
    pub name: Option<String>,
    pub description: Patch<String>,
    pub color: Patch<String>,
    pub status: Option<ProjectStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTaskInput {
    pub title: String,
    pub description: Option<String>,
    pub notes_markdown: Option<String>,
    pub project_id: Option<String>,
    pub priority: Option<Priority>,
    pub is_important: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub remind_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTaskInput {
    pub title: Option<String>,
    pub description: Patch<String>,
    pub notes_markdown: Patch<String>,
    pub project_id: Patch<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<Priority>,
    pub is_important: Option<bool>,
    pub due_at: Patch<DateTime<Utc>>,
    pub remind_at: Patch<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTemplateInput {
    pub name: String,
    pub title_template: Option<String>,
    pub description: Option<String>,
    pub priority: Option<Priority>,
    pub is_important: bool,
    pub due_offset_minutes: Option<i64>,
    pub remind_offset_minutes: Option<i64>,
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateTemplateInput {
    pub name: Option<String>,
    pub title_template: Patch<String>,
    pub description: Patch<String>,
    pub priority: Option<Priority>,
    pub is_important: Option<bool>,
    pub due_offset_minutes: Patch<i64>,
    pub remind_offset_minutes: Patch<i64>,
    pub recurrence: Option<Recurrence>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::SequentialIdGenerator;

    async fn test_api() -> MutationApi {
        let store = Store::open_in_memory().await.unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let ids = Arc::new(SequentialIdGenerator::new("id"));
        MutationApi::new(store, clock, ids)
    }

    #[tokio::test]
    async fn create_project_rejects_empty_name() {
        let api = test_api().await;
        let err = api
            .create_project(NewProjectInput {
                name: "   ".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "PROJECT_NAME_REQUIRED"));
    }

    #[tokio::test]
    async fn create_project_rejects_duplicate_name_case_insensitive() {
        let api = test_api().await;
        api.create_project(NewProjectInput {
            name: "Garden".into(),
            ..Default::default()
        })
        .await
        .unwrap();
        let err = api
            .create_project(NewProjectInput {
                name: "garden".into(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConstraintViolation(ref m) if m == "PROJECT_NAME_EXISTS"));
    }

    #[tokio::test]
    async fn create_project_emits_one_outbox_row() {
        let api = test_api().await;
        let project = api
            .create_project(NewProjectInput {
                name: "Garden".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let rows = outbox::list_outbox(api.store.pool(), 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity_id, project.id);
        assert_eq!(rows[0].operation, Operation::Upsert);
    }

    #[tokio::test]
    async fn create_task_rejects_unknown_project() {
        let api = test_api().await;
        let err = api
            .create_task(NewTaskInput {
                title: "Water plants".into(),
                project_id: Some("missing".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "TASK_PROJECT_NOT_FOUND"));
    }

    #[tokio::test]
    async fn completing_recurring_task_spawns_next_occurrence() {
        let api = test_api().await;
        let due = Utc::now();
        let task = api
            .create_task(NewTaskInput {
                title: "Water plants".into(),
                due_at: Some(due),
                remind_at: Some(due - chrono::Duration::hours(1)),
                recurrence: Some(Recurrence::Daily),
                ..Default::default()
            })
            .await
            .unwrap();

        api.update_task(
            &task.id,
            UpdateTaskInput {
                status: Some(TaskStatus::Done),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let rows = outbox::list_outbox(api.store.pool(), 10).await.unwrap();
        // create + update + spawned-next-occurrence = 3 outbox rows.
        assert_eq!(rows.len(), 3);
        let spawned_id = &rows[2].entity_id;
        let spawned = entities::get_task(api.store.pool(), spawned_id).await.unwrap().unwrap();
        assert_eq!(spawned.due_at, Some(due + chrono::Duration::days(1)));
        assert_eq!(spawned.status, TaskStatus::Todo);
    }

    #[tokio::test]
    async fn put_setting_skips_outbox_for_local_only_key() {
        let api = test_api().await;
        api.put_setting("local.theme", "dark").await.unwrap();
        assert_eq!(outbox::outbox_len(api.store.pool()).await.unwrap(), 0);
        assert_eq!(api.get_setting("local.theme").await.unwrap().as_deref(), Some("dark"));
    }

    #[tokio::test]
    async fn put_setting_emits_outbox_for_synced_key() {
        let api = test_api().await;
        api.put_setting("notifications.enabled", "true").await.unwrap();
        assert_eq!(outbox::outbox_len(api.store.pool()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn create_subtask_rejects_unknown_task() {
        let api = test_api().await;
        let err = api.create_subtask("missing", "Buy soil").await.unwrap_err();
        assert!(matches!(err, Error::Validation(ref m) if m == "SUBTASK_TASK_NOT_FOUND"));
    }

    #[tokio::test]
    async fn create_template_enforces_offset_invariant() {
        let api = test_api().await;
        let err = api
            .create_template(NewTemplateInput {
                name: "Weekly review".into(),
                recurrence: Some(Recurrence::Weekly),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}

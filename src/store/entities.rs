//! store/entities.rs - Typed queries for domain entities and settings.

use chrono::{DateTime, Utc};
use sqlx::Row;

use super::models::{
    EntityType, Priority, Project, ProjectStatus, Recurrence, Setting, SyncShadow, Task,
    TaskChangelogEntry, TaskStatus, TaskSubtask, TaskTemplate,
};
use crate::{Error, Result};

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        color: row.try_get("color")?,
        status: ProjectStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .ok_or_else(|| Error::Store("invalid project status in row".to_string()))?,
        created_at: parse_instant(row.try_get("created_at")?)?,
        shadow: SyncShadow {
            updated_at: parse_instant(row.try_get("updated_at")?)?,
            updated_by_device: row.try_get("updated_by_device")?,
            sync_version: row.try_get("sync_version")?,
        },
    })
}

fn parse_instant(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Store(format!("invalid stored timestamp {s:?}: {e}")))
}

pub async fn project_name_exists(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, name: &str, excluding_id: Option<&str>) -> Result<bool> {
    let name_lower = name.to_lowercase();
    let count: (i64,) = match excluding_id {
        Some(id) => {
            sqlx::query_as("SELECT COUNT(*) FROM projects WHERE name_lower = ? AND id != ?")
                .bind(&name_lower)
                .bind(id)
                .fetch_one(executor)
                .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM projects WHERE name_lower = ?")
                .bind(&name_lower)
                .fetch_one(executor)
                .await?
        }
    };
    Ok(count.0 > 0)
}

pub async fn upsert_project(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projects (id, name, name_lower, description, color, status, created_at, updated_at, updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            name_lower = excluded.name_lower,
            description = excluded.description,
            color = excluded.color,
            status = excluded.status,
            updated_at = excluded.updated_at,
            updated_by_device = excluded.updated_by_device,
            sync_version = excluded.sync_version
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(project.name.to_lowercase())
    .bind(&project.description)
    .bind(&project.color)
    .bind(project.status.as_str())
    .bind(project.created_at.to_rfc3339())
    .bind(project.shadow.updated_at.to_rfc3339())
    .bind(&project.shadow.updated_by_device)
    .bind(project.shadow.sync_version)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_project(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_project).transpose()
}

pub async fn list_projects(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
    let rows = match status {
        Some(s) => {
            sqlx::query("SELECT * FROM projects WHERE status = ? ORDER BY updated_at DESC")
                .bind(s.as_str())
                .fetch_all(executor)
                .await?
        }
        None => {
            sqlx::query("SELECT * FROM projects ORDER BY updated_at DESC")
                .fetch_all(executor)
                .await?
        }
    };
    rows.iter().map(row_to_project).collect()
}

pub async fn delete_project(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<()> {
    // ON DELETE SET NULL on tasks.project_id and ON DELETE CASCADE on
    // task_subtasks(task_id) handle the cascade rules.
    sqlx::query("DELETE FROM projects WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        notes_markdown: row.try_get("notes_markdown")?,
        project_id: row.try_get("project_id")?,
        status: TaskStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .ok_or_else(|| Error::Store("invalid task status in row".to_string()))?,
        priority: Priority::parse(row.try_get::<String, _>("priority")?.as_str())
            .ok_or_else(|| Error::Store("invalid task priority in row".to_string()))?,
        is_important: row.try_get::<i64, _>("is_important")? != 0,
        due_at: row
            .try_get::<Option<String>, _>("due_at")?
            .map(parse_instant)
            .transpose()?,
        remind_at: row
            .try_get::<Option<String>, _>("remind_at")?
            .map(parse_instant)
            .transpose()?,
        recurrence: Recurrence::parse(row.try_get::<String, _>("recurrence")?.as_str())
            .ok_or_else(|| Error::Store("invalid task recurrence in row".to_string()))?,
        created_at: parse_instant(row.try_get("created_at")?)?,
        shadow: SyncShadow {
            updated_at: parse_instant(row.try_get("updated_at")?)?,
            updated_by_device: row.try_get("updated_by_device")?,
            sync_version: row.try_get("sync_version")?,
        },
    })
}

pub async fn upsert_task(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, title, description, notes_markdown, project_id, status, priority,
                           is_important, due_at, remind_at, recurrence, created_at, updated_at,
                           updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            description = excluded.description,
            notes_markdown = excluded.notes_markdown,
            project_id = excluded.project_id,
            status = excluded.status,
            priority = excluded.priority,
            is_important = excluded.is_important,
            due_at = excluded.due_at,
            remind_at = excluded.remind_at,
            recurrence = excluded.recurrence,
            updated_at = excluded.updated_at,
            updated_by_device = excluded.updated_by_device,
            sync_version = excluded.sync_version
        "#,
    )
    .bind(&task.id)
    .bind(&task.title)
    .bind(&task.description)
    .bind(&task.notes_markdown)
    .bind(&task.project_id)
    .bind(task.status.as_str())
    .bind(task.priority.as_str())
    .bind(task.is_important as i64)
    .bind(task.due_at.map(|t| t.to_rfc3339()))
    .bind(task.remind_at.map(|t| t.to_rfc3339()))
    .bind(task.recurrence.as_str())
    .bind(task.created_at.to_rfc3339())
    .bind(task.shadow.updated_at.to_rfc3339())
    .bind(&task.shadow.updated_by_device)
    .bind(task.shadow.sync_version)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_task(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<Option<Task>> {
    let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_task).transpose()
}

pub async fn list_tasks_by_project(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, project_id: &str) -> Result<Vec<Task>> {
    let rows = sqlx::query("SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at DESC")
        .bind(project_id)
        .fetch_all(executor)
        .await?;
    rows.iter().map(row_to_task).collect()
}

pub async fn delete_task(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

fn row_to_subtask(row: &sqlx::sqlite::SqliteRow) -> Result<TaskSubtask> {
    Ok(TaskSubtask {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        title: row.try_get("title")?,
        is_done: row.try_get::<i64, _>("is_done")? != 0,
        created_at: parse_instant(row.try_get("created_at")?)?,
        shadow: SyncShadow {
            updated_at: parse_instant(row.try_get("updated_at")?)?,
            updated_by_device: row.try_get("updated_by_device")?,
            sync_version: row.try_get("sync_version")?,
        },
    })
}

pub async fn upsert_subtask(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, subtask: &TaskSubtask) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_subtasks (id, task_id, title, is_done, created_at, updated_at, updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            task_id = excluded.task_id,
            title = excluded.title,
            is_done = excluded.is_done,
            updated_at = excluded.updated_at,
            updated_by_device = excluded.updated_by_device,
            sync_version = excluded.sync_version
        "#,
    )
    .bind(&subtask.id)
    .bind(&subtask.task_id)
    .bind(&subtask.title)
    .bind(subtask.is_done as i64)
    .bind(subtask.created_at.to_rfc3339())
    .bind(subtask.shadow.updated_at.to_rfc3339())
    .bind(&subtask.shadow.updated_by_device)
    .bind(subtask.shadow.sync_version)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_subtask(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<Option<TaskSubtask>> {
    let row = sqlx::query("SELECT * FROM task_subtasks WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_subtask).transpose()
}

pub async fn list_subtasks_for_task(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, task_id: &str) -> Result<Vec<TaskSubtask>> {
    let rows = sqlx::query("SELECT * FROM task_subtasks WHERE task_id = ? ORDER BY created_at DESC")
        .bind(task_id)
        .fetch_all(executor)
        .await?;
    rows.iter().map(row_to_subtask).collect()
}

pub async fn delete_subtask(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM task_subtasks WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn task_exists(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<bool> {
    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_one(executor)
        .await?;
    Ok(count.0 > 0)
}

fn row_to_template(row: &sqlx::sqlite::SqliteRow) -> Result<TaskTemplate> {
    Ok(TaskTemplate {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        title_template: row.try_get("title_template")?,
        description: row.try_get("description")?,
        priority: Priority::parse(row.try_get::<String, _>("priority")?.as_str())
            .ok_or_else(|| Error::Store("invalid template priority in row".to_string()))?,
        is_important: row.try_get::<i64, _>("is_important")? != 0,
        due_offset_minutes: row.try_get("due_offset_minutes")?,
        remind_offset_minutes: row.try_get("remind_offset_minutes")?,
        recurrence: Recurrence::parse(row.try_get::<String, _>("recurrence")?.as_str())
            .ok_or_else(|| Error::Store("invalid template recurrence in row".to_string()))?,
        created_at: parse_instant(row.try_get("created_at")?)?,
        shadow: SyncShadow {
            updated_at: parse_instant(row.try_get("updated_at")?)?,
            updated_by_device: row.try_get("updated_by_device")?,
            sync_version: row.try_get("sync_version")?,
        },
    })
}

pub async fn upsert_template(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, template: &TaskTemplate) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_templates (id, name, name_lower, title_template, description, priority,
                                    is_important, due_offset_minutes, remind_offset_minutes,
                                    recurrence, created_at, updated_at, updated_by_device, sync_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            name_lower = excluded.name_lower,
            title_template = excluded.title_template,
            description = excluded.description,
            priority = excluded.priority,
            is_important = excluded.is_important,
            due_offset_minutes = excluded.due_offset_minutes,
            remind_offset_minutes = excluded.remind_offset_minutes,
            recurrence = excluded.recurrence,
            updated_at = excluded.updated_at,
            updated_by_device = excluded.updated_by_device,
            sync_version = excluded.sync_version
        "#,
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(template.name.to_lowercase())
    .bind(&template.title_template)
    .bind(&template.description)
    .bind(template.priority.as_str())
    .bind(template.is_important as i64)
    .bind(template.due_offset_minutes)
    .bind(template.remind_offset_minutes)
    .bind(template.recurrence.as_str())
    .bind(template.created_at.to_rfc3339())
    .bind(template.shadow.updated_at.to_rfc3339())
    .bind(&template.shadow.updated_by_device)
    .bind(template.shadow.sync_version)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_template(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<Option<TaskTemplate>> {
    let row = sqlx::query("SELECT * FROM task_templates WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(row_to_template).transpose()
}

pub async fn template_name_exists(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, name: &str, excluding_id: Option<&str>) -> Result<bool> {
    let name_lower = name.to_lowercase();
    let count: (i64,) = match excluding_id {
        Some(id) => {
            sqlx::query_as("SELECT COUNT(*) FROM task_templates WHERE name_lower = ? AND id != ?")
                .bind(&name_lower)
                .bind(id)
                .fetch_one(executor)
                .await?
        }
        None => {
            sqlx::query_as("SELECT COUNT(*) FROM task_templates WHERE name_lower = ?")
                .bind(&name_lower)
                .fetch_one(executor)
                .await?
        }
    };
    Ok(count.0 > 0)
}

pub async fn delete_template(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM task_templates WHERE id = ?")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Raw setting read, bypassing the local-only confinement rule that the
/// mutation and sync layers enforce on top (this only governs outbox
/// emission and inbound apply, not local reads by the host).
pub async fn get_setting_raw(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, key: &str) -> Result<Option<String>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn upsert_setting(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, setting: &Setting) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(&setting.key)
    .bind(&setting.value)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn delete_setting(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM settings WHERE key = ?")
        .bind(key)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn insert_changelog(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, entry: &TaskChangelogEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO task_changelog (id, task_id, action, field_name, old_value, new_value, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.id)
    .bind(&entry.task_id)
    .bind(match entry.action {
        super::models::ChangelogAction::Created => "CREATED",
        super::models::ChangelogAction::Updated => "UPDATED",
        super::models::ChangelogAction::StatusChanged => "STATUS_CHANGED",
    })
    .bind(&entry.field_name)
    .bind(&entry.old_value)
    .bind(&entry.new_value)
    .bind(entry.created_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

/// Just the sync-shadow projection of an existing row, independent of
/// entity type — what the LWW comparator in the sync engine needs.
pub async fn get_existing_shadow(
    executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Option<SyncShadow>> {
    Ok(match entity_type {
        EntityType::Project => get_project(executor, entity_id).await?.map(|p| p.shadow),
        EntityType::Task => get_task(executor, entity_id).await?.map(|t| t.shadow),
        EntityType::TaskSubtask => get_subtask(executor, entity_id).await?.map(|s| s.shadow),
        EntityType::TaskTemplate => get_template(executor, entity_id).await?.map(|t| t.shadow),
        EntityType::Setting => None,
    })
}

/// Deletes any entity by type + id. Cascade rules are expressed as foreign
/// key actions in the schema.
pub async fn delete_entity(executor: impl sqlx::Executor<'_, Database = sqlx::Sqlite>, entity_type: EntityType, entity_id: &str) -> Result<()> {
    match entity_type {
        EntityType::Project => delete_project(executor, entity_id).await,
        EntityType::Task => delete_task(executor, entity_id).await,
        EntityType::TaskSubtask => delete_subtask(executor, entity_id).await,
        EntityType::TaskTemplate => delete_template(executor, entity_id).await,
        EntityType::Setting => delete_setting(executor, entity_id).await,
    }
}

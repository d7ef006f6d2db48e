//! store/migrations.rs - Database schema migrations
//!
//! Migrations are idempotent and safe to run multiple times, tracked by a
//! `_migrations` ledger table and applied as numbered steps.

use sqlx::SqlitePool;

use crate::Result;

/// Run all database migrations.
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    run_if_needed(pool, 1, "create_projects_table").await?;
    run_if_needed(pool, 2, "create_tasks_table").await?;
    run_if_needed(pool, 3, "create_task_subtasks_table").await?;
    run_if_needed(pool, 4, "create_task_templates_table").await?;
    run_if_needed(pool, 5, "create_settings_table").await?;
    run_if_needed(pool, 6, "create_task_changelog_table").await?;
    run_if_needed(pool, 7, "create_outbox_table").await?;
    run_if_needed(pool, 8, "create_deleted_records_table").await?;
    run_if_needed(pool, 9, "create_checkpoint_table").await?;
    run_if_needed(pool, 10, "create_conflicts_table").await?;
    run_if_needed(pool, 11, "create_conflict_events_table").await?;
    run_if_needed(pool, 12, "create_indices").await?;

    Ok(())
}

async fn run_if_needed(pool: &SqlitePool, id: i32, name: &str) -> Result<()> {
    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;

    if exists.0 == 0 {
        tracing::info!(migration = id, %name, "running migration");

        match id {
            1 => create_projects_table(pool).await?,
            2 => create_tasks_table(pool).await?,
            3 => create_task_subtasks_table(pool).await?,
            4 => create_task_templates_table(pool).await?,
            5 => create_settings_table(pool).await?,
            6 => create_task_changelog_table(pool).await?,
            7 => create_outbox_table(pool).await?,
            8 => create_deleted_records_table(pool).await?,
            9 => create_checkpoint_table(pool).await?,
            10 => create_conflicts_table(pool).await?,
            11 => create_conflict_events_table(pool).await?,
            12 => create_indices(pool).await?,
            _ => return Err(crate::Error::Config(format!("unknown migration id: {id}"))),
        }

        sqlx::query("INSERT INTO _migrations (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(pool)
            .await?;

        tracing::info!(migration = id, "migration completed");
    }

    Ok(())
}

async fn create_projects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_lower TEXT NOT NULL,
            description TEXT,
            color TEXT,
            status TEXT NOT NULL CHECK(status IN ('ACTIVE','COMPLETED','ARCHIVED')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            UNIQUE(name_lower)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_tasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            notes_markdown TEXT,
            project_id TEXT REFERENCES projects(id) ON DELETE SET NULL,
            status TEXT NOT NULL CHECK(status IN ('TODO','DOING','DONE','ARCHIVED')),
            priority TEXT NOT NULL CHECK(priority IN ('URGENT','NORMAL','LOW')),
            is_important INTEGER NOT NULL DEFAULT 0,
            due_at TEXT,
            remind_at TEXT,
            recurrence TEXT NOT NULL CHECK(recurrence IN ('NONE','DAILY','WEEKLY','MONTHLY')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_task_subtasks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE task_subtasks (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            is_done INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_task_templates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE task_templates (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_lower TEXT NOT NULL,
            title_template TEXT,
            description TEXT,
            priority TEXT NOT NULL CHECK(priority IN ('URGENT','NORMAL','LOW')),
            is_important INTEGER NOT NULL DEFAULT 0,
            due_offset_minutes INTEGER,
            remind_offset_minutes INTEGER,
            recurrence TEXT NOT NULL CHECK(recurrence IN ('NONE','DAILY','WEEKLY','MONTHLY')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            updated_by_device TEXT NOT NULL,
            sync_version INTEGER NOT NULL DEFAULT 1,
            UNIQUE(name_lower)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_task_changelog_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE task_changelog (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            action TEXT NOT NULL CHECK(action IN ('CREATED','UPDATED','STATUS_CHANGED')),
            field_name TEXT,
            old_value TEXT,
            new_value TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_outbox_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL CHECK(entity_type IN ('PROJECT','TASK','TASK_SUBTASK','TASK_TEMPLATE','SETTING')),
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL CHECK(operation IN ('UPSERT','DELETE')),
            payload_json TEXT,
            idempotency_key TEXT NOT NULL UNIQUE,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_deleted_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE deleted_records (
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            deleted_at TEXT NOT NULL,
            deleted_by_device TEXT NOT NULL,
            PRIMARY KEY (entity_type, entity_id)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_checkpoint_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE checkpoint (
            id INTEGER PRIMARY KEY CHECK(id = 1),
            last_sync_cursor TEXT,
            last_synced_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO checkpoint (id, last_sync_cursor, last_synced_at) VALUES (1, NULL, NULL)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_conflicts_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE conflicts (
            id TEXT PRIMARY KEY,
            incoming_idempotency_key TEXT NOT NULL UNIQUE,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            conflict_type TEXT NOT NULL,
            reason_code TEXT NOT NULL,
            message TEXT NOT NULL,
            local_payload TEXT,
            remote_payload TEXT,
            base_payload TEXT,
            status TEXT NOT NULL CHECK(status IN ('open','resolved','ignored')),
            resolution_strategy TEXT,
            resolution_payload TEXT,
            resolved_by_device TEXT,
            detected_at TEXT NOT NULL,
            resolved_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_conflict_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE conflict_events (
            id TEXT PRIMARY KEY,
            conflict_id TEXT NOT NULL REFERENCES conflicts(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL CHECK(event_type IN ('detected','resolved','ignored','retried','exported')),
            event_payload TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_indices(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE INDEX idx_projects_status_updated ON projects(status, updated_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_tasks_project_id ON tasks(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_tasks_due_at ON tasks(due_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_subtasks_task_created ON task_subtasks(task_id, created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_changelog_task_created ON task_changelog(task_id, created_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX idx_conflicts_status_detected ON conflicts(status, detected_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX idx_conflicts_entity ON conflicts(entity_type, entity_id, detected_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX idx_outbox_created_at ON outbox(created_at)")
        .execute(pool)
        .await?;
    Ok(())
}

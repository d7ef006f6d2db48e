//! wire/payload.rs - Domain-only payload shapes carried inside a
//! `SyncChange`. These mirror the Store's entity structs but drop the
//! sync-shadow fields (`updated_at`, `updated_by_device`, `sync_version`),
//! since those travel as top-level `SyncChange` fields instead and are the
//! ones the engine actually compares for LWW. Keeping them out of the
//! payload avoids a second, possibly-stale copy of the same data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::models::{
    Priority, Project, ProjectStatus, Recurrence, Setting, Task, TaskStatus, TaskSubtask,
    TaskTemplate,
};
use crate::{Error, Result};

fn from_value<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| Error::InvalidEnvelope(format!("malformed payload: {e}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectPayload {
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Project> for ProjectPayload {
    fn from(p: &Project) -> Self {
        Self {
            name: p.name.clone(),
            description: p.description.clone(),
            color: p.color.clone(),
            status: p.status,
            created_at: p.created_at,
        }
    }
}

impl ProjectPayload {
    pub fn parse(payload: &Value) -> Result<Self> {
        from_value(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    pub title: String,
    pub description: Option<String>,
    pub notes_markdown: Option<String>,
    pub project_id: Option<String>,
    pub status: TaskStatus,
    pub priority: Priority,
    pub is_important: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub remind_at: Option<DateTime<Utc>>,
    pub recurrence: Recurrence,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskPayload {
    fn from(t: &Task) -> Self {
        Self {
            title: t.title.clone(),
            description: t.description.clone(),
            notes_markdown: t.notes_markdown.clone(),
            project_id: t.project_id.clone(),
            status: t.status,
            priority: t.priority,
            is_important: t.is_important,
            due_at: t.due_at,
            remind_at: t.remind_at,
            recurrence: t.recurrence,
            created_at: t.created_at,
        }
    }
}

impl TaskPayload {
    pub fn parse(payload: &Value) -> Result<Self> {
        from_value(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubtaskPayload {
    pub task_id: String,
    pub title: String,
    pub is_done: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&TaskSubtask> for TaskSubtaskPayload {
    fn from(s: &TaskSubtask) -> Self {
        Self {
            task_id: s.task_id.clone(),
            title: s.title.clone(),
            is_done: s.is_done,
            created_at: s.created_at,
        }
    }
}

impl TaskSubtaskPayload {
    pub fn parse(payload: &Value) -> Result<Self> {
        from_value(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplatePayload {
    pub name: String,
    pub title_template: Option<String>,
    pub description: Option<String>,
    pub priority: Priority,
    pub is_important: bool,
    pub due_offset_minutes: Option<i64>,
    pub remind_offset_minutes: Option<i64>,
    pub recurrence: Recurrence,
    pub created_at: DateTime<Utc>,
}

impl From<&TaskTemplate> for TaskTemplatePayload {
    fn from(t: &TaskTemplate) -> Self {
        Self {
            name: t.name.clone(),
            title_template: t.title_template.clone(),
            description: t.description.clone(),
            priority: t.priority,
            is_important: t.is_important,
            due_offset_minutes: t.due_offset_minutes,
            remind_offset_minutes: t.remind_offset_minutes,
            recurrence: t.recurrence,
            created_at: t.created_at,
        }
    }
}

impl TaskTemplatePayload {
    pub fn parse(payload: &Value) -> Result<Self> {
        from_value(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingPayload {
    pub value: String,
}

impl From<&Setting> for SettingPayload {
    fn from(s: &Setting) -> Self {
        Self { value: s.value.clone() }
    }
}

impl SettingPayload {
    pub fn parse(payload: &Value) -> Result<Self> {
        from_value(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::SyncShadow;
    use serde_json::json;

    #[test]
    fn project_payload_round_trips_through_json() {
        let project = Project {
            id: "p1".into(),
            name: "Garden".into(),
            description: None,
            color: Some("#00ff00".into()),
            status: ProjectStatus::Active,
            created_at: Utc::now(),
            shadow: SyncShadow {
                updated_at: Utc::now(),
                updated_by_device: "D1".into(),
                sync_version: 1,
            },
        };
        let payload = ProjectPayload::from(&project);
        let value = serde_json::to_value(&payload).unwrap();
        let parsed = ProjectPayload::parse(&value).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn parse_rejects_malformed_payload() {
        let err = TaskPayload::parse(&json!({"title": 5})).unwrap_err();
        assert!(matches!(err, Error::InvalidEnvelope(_)));
    }
}

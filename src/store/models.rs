//! store/models.rs - Domain entities and sync-shadow rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The closed set of synchronizable entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Project,
    Task,
    TaskSubtask,
    TaskTemplate,
    Setting,
}

impl EntityType {
    /// Ordering priority used by the deterministic wire-order comparator:
    /// `PROJECT < TASK < TASK_SUBTASK < TASK_TEMPLATE < SETTING`. Derived
    /// automatically from declaration order via `PartialOrd`/`Ord`, but
    /// spelled out here because that ordering is a load-bearing contract,
    /// not an implementation detail.
    pub fn priority(self) -> u8 {
        match self {
            EntityType::Project => 0,
            EntityType::Task => 1,
            EntityType::TaskSubtask => 2,
            EntityType::TaskTemplate => 3,
            EntityType::Setting => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Project => "PROJECT",
            EntityType::Task => "TASK",
            EntityType::TaskSubtask => "TASK_SUBTASK",
            EntityType::TaskTemplate => "TASK_TEMPLATE",
            EntityType::Setting => "SETTING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PROJECT" => Some(EntityType::Project),
            "TASK" => Some(EntityType::Task),
            "TASK_SUBTASK" => Some(EntityType::TaskSubtask),
            "TASK_TEMPLATE" => Some(EntityType::TaskTemplate),
            "SETTING" => Some(EntityType::Setting),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of mutation operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Upsert,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Upsert => "UPSERT",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPSERT" => Some(Operation::Upsert),
            "DELETE" => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// The four sync-shadow fields every synchronizable row carries in addition
/// to its domain fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncShadow {
    pub updated_at: DateTime<Utc>,
    pub updated_by_device: String,
    pub sync_version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectStatus {
    Active,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::Completed => "COMPLETED",
            ProjectStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(ProjectStatus::Active),
            "COMPLETED" => Some(ProjectStatus::Completed),
            "ARCHIVED" => Some(ProjectStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: Option<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub shadow: SyncShadow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Todo,
    Doing,
    Done,
    Archived,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::Doing => "DOING",
            TaskStatus::Done => "DONE",
            TaskStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TODO" => Some(TaskStatus::Todo),
            "DOING" => Some(TaskStatus::Doing),
            "DONE" => Some(TaskStatus::Done),
            "ARCHIVED" => Some(TaskStatus::Archived),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Urgent,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Urgent => "URGENT",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "URGENT" => Some(Priority::Urgent),
            "NORMAL" => Some(Priority::Normal),
            "LOW" => Some(Priority::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

impl Recurrence {
    pub fn as_str(self) -> &'static str {
        match self {
            Recurrence::None => "NONE",
            Recurrence::Daily => "DAILY",
            Recurrence::Weekly => "WEEKLY",
            Recurrence::Monthly => "MONTHLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONE" => Some(Recurrence::None),
            "DAILY" => Some(Recurrence::Daily),
            "WEEKLY" => Some(Recurrence::Weekly),
            "MONTHLY" => Some(Recurrence::Monthly),
            _ => None,
        }
    }

    /// Advances `from` to the next occurrence (`DAILY`->+1 day,
    /// `WEEKLY`->+7 days, `MONTHLY`->+1 calendar month).
    pub fn advance(self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Recurrence::None => None,
            Recurrence::Daily => Some(from + chrono::Duration::days(1)),
            Recurrence::Weekly => Some(from + chrono::Duration::days(7)),
            Recurrence::Monthly => Some(add_calendar_month(from)),
        }
    }
}

/// Adds one calendar month, clamping the day-of-month into the target
/// month's length (e.g. Jan 31 + 1 month -> Feb 28/29).
fn add_calendar_month(from: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{Datelike, TimeZone};

    let (year, month) = if from.month() == 12 {
        (from.year() + 1, 1)
    } else {
        (from.year(), from.month() + 1)
    };

    let last_day_of_target_month = last_day_of_month(year, month);
    let day = from.day().min(last_day_of_target_month);

    Utc.with_ymd_and_hms(
        year,
        month,
        day,
        from.hour(),
        from.minute(),
        from.second(),
    )
    .single()
    .expect("clamped day is always valid for its month")
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    use chrono::{Datelike, NaiveDate};
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .expect("valid y/m")
        .pred_opt()
        .expect("first of month always has a predecessor")
        .day()
}

use chrono::Timelike;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
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
    pub shadow: SyncShadow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSubtask {
    pub id: String,
    pub task_id: String,
    pub title: String,
    pub is_done: bool,
    pub created_at: DateTime<Utc>,
    pub shadow: SyncShadow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: String,
    pub name: String,
    pub title_template: Option<String>,
    pub description: Option<String>,
    pub priority: Priority,
    pub is_important: bool,
    pub due_offset_minutes: Option<i64>,
    pub remind_offset_minutes: Option<i64>,
    pub recurrence: Recurrence,
    pub created_at: DateTime<Utc>,
    pub shadow: SyncShadow,
}

impl TaskTemplate {
    /// A recurring template must carry a due offset, and when both offsets
    /// exist the reminder must fire at or before the due time.
    pub fn validate_offsets(&self) -> Result<(), &'static str> {
        if self.recurrence != Recurrence::None && self.due_offset_minutes.is_none() {
            return Err("recurring templates require due_offset_minutes");
        }
        if let (Some(remind), Some(due)) = (self.remind_offset_minutes, self.due_offset_minutes) {
            if remind > due {
                return Err("remind_offset_minutes must be <= due_offset_minutes");
            }
        }
        Ok(())
    }
}

/// `{key (PK), value}` setting row. Keys in the reserved local-only
/// namespace or the special device-id key never leave the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

/// Prefix marking a setting key as local-only.
pub const LOCAL_ONLY_PREFIX: &str = "local.";
/// The special key holding this installation's device id; never synced,
/// generated once via UUID v4.
pub const DEVICE_ID_KEY: &str = "__device_id__";

/// True if a setting key must never appear in an outbox row or inbound
/// apply.
pub fn is_local_only_key(key: &str) -> bool {
    key.starts_with(LOCAL_ONLY_PREFIX) || key == DEVICE_ID_KEY
}

/// Local-only task history row; changelogs are local-only by design and
/// never cross the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskChangelogEntry {
    pub id: String,
    pub task_id: String,
    pub action: ChangelogAction,
    pub field_name: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangelogAction {
    Created,
    Updated,
    StatusChanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn entity_type_priority_matches_parent_before_child_order() {
        assert!(EntityType::Project.priority() < EntityType::Task.priority());
        assert!(EntityType::Task.priority() < EntityType::TaskSubtask.priority());
        assert!(EntityType::TaskSubtask.priority() < EntityType::TaskTemplate.priority());
        assert!(EntityType::TaskTemplate.priority() < EntityType::Setting.priority());
    }

    #[test]
    fn recurrence_advance_daily() {
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let next = Recurrence::Daily.advance(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn recurrence_advance_monthly_clamps_day() {
        let from = Utc.with_ymd_and_hms(2026, 1, 31, 8, 0, 0).unwrap();
        let next = Recurrence::Monthly.advance(from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 28, 8, 0, 0).unwrap());
    }

    #[test]
    fn recurrence_none_has_no_next_occurrence() {
        let from = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        assert_eq!(Recurrence::None.advance(from), None);
    }

    #[test]
    fn local_only_key_detection() {
        assert!(is_local_only_key("local.theme"));
        assert!(is_local_only_key(DEVICE_ID_KEY));
        assert!(!is_local_only_key("notifications.enabled"));
    }

    #[test]
    fn template_offset_invariants() {
        let mut t = TaskTemplate {
            id: "t1".into(),
            name: "Weekly review".into(),
            title_template: None,
            description: None,
            priority: Priority::Normal,
            is_important: false,
            due_offset_minutes: None,
            remind_offset_minutes: None,
            recurrence: Recurrence::Weekly,
            created_at: Utc::now(),
            shadow: SyncShadow {
                updated_at: Utc::now(),
                updated_by_device: "D1".into(),
                sync_version: 1,
            },
        };
        assert!(t.validate_offsets().is_err());
        t.due_offset_minutes = Some(60);
        assert!(t.validate_offsets().is_ok());
        t.remind_offset_minutes = Some(120);
        assert!(t.validate_offsets().is_err());
        t.remind_offset_minutes = Some(30);
        assert!(t.validate_offsets().is_ok());
    }
}

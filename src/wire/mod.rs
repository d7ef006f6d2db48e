//! wire/mod.rs - Wire contract: push/pull envelopes, normalization of
//! malformed fields, and the deterministic change ordering used for
//! outgoing and incoming batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::models::{EntityType, Operation};
use crate::{Error, Result};

pub mod payload;

pub const SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_PULL_LIMIT: u32 = 200;
pub const MIN_PULL_LIMIT: u32 = 1;
pub const MAX_PULL_LIMIT: u32 = 500;

/// One row of the wire protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub operation: Operation,
    pub updated_at: DateTime<Utc>,
    pub updated_by_device: String,
    pub sync_version: i64,
    pub payload: Value,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub schema_version: u32,
    pub device_id: String,
    pub base_cursor: Option<String>,
    pub changes: Vec<SyncChange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    Conflict,
    InvalidPayload,
    RateLimited,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectedChange {
    pub idempotency_key: String,
    pub reason: RejectReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: Vec<String>,
    pub rejected: Vec<RejectedChange>,
    pub server_cursor: String,
    pub server_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub schema_version: u32,
    pub device_id: String,
    pub cursor: Option<String>,
    pub limit: u32,
}

impl PullRequest {
    pub fn new(device_id: impl Into<String>, cursor: Option<String>, limit: u32) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            device_id: device_id.into(),
            cursor,
            limit: limit.clamp(MIN_PULL_LIMIT, MAX_PULL_LIMIT),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub server_cursor: String,
    pub server_time: String,
    pub has_more: bool,
    pub changes: Vec<SyncChange>,
}

/// Server error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerErrorBody {
    pub code: ServerErrorCode,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerErrorCode {
    RateLimited,
    Unauthorized,
    Conflict,
    NotFound,
    InvalidArgument,
    InternalError,
}

impl ServerErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerErrorCode::RateLimited => "RATE_LIMITED",
            ServerErrorCode::Unauthorized => "UNAUTHORIZED",
            ServerErrorCode::Conflict => "CONFLICT",
            ServerErrorCode::NotFound => "NOT_FOUND",
            ServerErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ServerErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Validates a freshly-deserialized envelope's schema version. Anything
/// else (missing fields) is already rejected by `serde` at parse time,
/// which maps to [`Error::InvalidEnvelope`] at the transport boundary.
pub fn validate_schema_version(version: u32) -> Result<()> {
    if version != SCHEMA_VERSION {
        return Err(Error::SchemaMismatch(format!(
            "expected schema_version {SCHEMA_VERSION}, got {version}"
        )));
    }
    Ok(())
}

/// Deterministic ordering comparator: ascending `updated_at` (lexicographic
/// on the ISO string), then ascending entity-type priority (parents before
/// children), then ascending `idempotency_key`.
pub fn ordering_key(change: &SyncChange) -> (String, u8, String) {
    (
        change.updated_at.to_rfc3339(),
        change.entity_type.priority(),
        change.idempotency_key.clone(),
    )
}

pub fn sort_changes(changes: &mut [SyncChange]) {
    changes.sort_by(|a, b| ordering_key(a).cmp(&ordering_key(b)));
}

/// Applies the documented fallbacks for malformed wire fields:
/// `updated_at -> epoch`, `sync_version <= 0 or non-integer -> 1`, DELETE
/// payload -> null, UPSERT payload -> empty object if not a JSON object.
pub fn normalize_change(mut change: SyncChange) -> SyncChange {
    if change.sync_version <= 0 {
        change.sync_version = 1;
    }

    change.payload = match change.operation {
        Operation::Delete => Value::Null,
        Operation::Upsert => match change.payload {
            Value::Object(map) => Value::Object(map),
            _ => Value::Object(serde_json::Map::new()),
        },
    };

    change
}

/// Parses an `updated_at` string with the epoch fallback, used where the
/// wire payload carries its own raw string rather than an already-typed
/// `DateTime`. Missing or malformed values fall back to the epoch.
pub fn parse_updated_at_or_epoch(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is always valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn change(entity_type: EntityType, updated_at: &str, key: &str) -> SyncChange {
        SyncChange {
            entity_type,
            entity_id: "x".into(),
            operation: Operation::Upsert,
            updated_at: DateTime::parse_from_rfc3339(updated_at).unwrap().with_timezone(&Utc),
            updated_by_device: "D1".into(),
            sync_version: 1,
            payload: json!({}),
            idempotency_key: key.into(),
        }
    }

    #[test]
    fn sorts_by_updated_at_then_entity_priority_then_key() {
        let mut changes = vec![
            change(EntityType::Task, "2026-03-01T10:00:00Z", "b"),
            change(EntityType::Project, "2026-03-01T10:00:00Z", "a"),
            change(EntityType::Project, "2026-03-01T09:00:00Z", "z"),
        ];
        sort_changes(&mut changes);
        assert_eq!(changes[0].idempotency_key, "z");
        assert_eq!(changes[1].idempotency_key, "a");
        assert_eq!(changes[2].idempotency_key, "b");
    }

    #[test]
    fn sort_is_deterministic_across_repeated_runs() {
        let base = vec![
            change(EntityType::Setting, "2026-03-01T10:00:00Z", "k3"),
            change(EntityType::Task, "2026-03-01T10:00:00Z", "k1"),
            change(EntityType::TaskSubtask, "2026-03-01T10:00:00Z", "k2"),
        ];
        let mut a = base.clone();
        let mut b = base;
        sort_changes(&mut a);
        sort_changes(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_clamps_sync_version() {
        let mut c = change(EntityType::Task, "2026-03-01T10:00:00Z", "k");
        c.sync_version = -5;
        let normalized = normalize_change(c);
        assert_eq!(normalized.sync_version, 1);
    }

    #[test]
    fn normalize_forces_delete_payload_to_null() {
        let mut c = change(EntityType::Task, "2026-03-01T10:00:00Z", "k");
        c.operation = Operation::Delete;
        c.payload = json!({"leftover": true});
        let normalized = normalize_change(c);
        assert_eq!(normalized.payload, Value::Null);
    }

    #[test]
    fn normalize_coerces_non_object_upsert_payload_to_empty_object() {
        let mut c = change(EntityType::Task, "2026-03-01T10:00:00Z", "k");
        c.payload = json!("not an object");
        let normalized = normalize_change(c);
        assert_eq!(normalized.payload, json!({}));
    }

    #[test]
    fn parse_updated_at_falls_back_to_epoch() {
        let parsed = parse_updated_at_or_epoch(Some("not a date"));
        assert_eq!(parsed, Utc.timestamp_opt(0, 0).unwrap());
        let parsed = parse_updated_at_or_epoch(None);
        assert_eq!(parsed, Utc.timestamp_opt(0, 0).unwrap());
    }

    #[test]
    fn rejects_mismatched_schema_version() {
        assert!(validate_schema_version(2).is_err());
        assert!(validate_schema_version(1).is_ok());
    }
}

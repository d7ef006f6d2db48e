//! End-to-end sync cycle scenarios, exercised against the public API the
//! way a host application would drive a full push/pull round trip.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use synccore::clock::{Clock, FixedClock};
use synccore::conflict::{ConflictApi, ResolutionStrategy};
use synccore::engine::SyncEngine;
use synccore::ids::{IdGenerator, SequentialIdGenerator};
use synccore::mutation::{MutationApi, NewProjectInput};
use synccore::store::conflicts::ConflictStatus;
use synccore::store::models::{EntityType, Operation};
use synccore::store::outbox;
use synccore::store::Store;
use synccore::wire::{PullResponse, PushResponse, SyncChange};

fn instant(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

async fn harness(now: DateTime<Utc>) -> (Store, Arc<FixedClock>, Arc<dyn IdGenerator>) {
    (Store::open_in_memory().await.unwrap(), Arc::new(FixedClock::new(now)), Arc::new(SequentialIdGenerator::new("row")))
}

#[tokio::test]
async fn offline_then_online_push() {
    let now = instant("2026-03-01T10:00:00Z");
    let (store, clock, ids) = harness(now).await;
    let mutation = MutationApi::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());
    mutation
        .create_project(NewProjectInput { name: "Alpha".into(), ..Default::default() })
        .await
        .unwrap();

    let engine = SyncEngine::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());
    let batch = engine.prepare_push("D1", None, 200).await.unwrap();
    assert_eq!(batch.request.changes.len(), 1);
    assert!(batch.entries[0].1.starts_with("D1:"));

    let response = PushResponse {
        accepted: vec![batch.entries[0].1.clone()],
        rejected: vec![],
        server_cursor: "c1".into(),
        server_time: "2026-03-01T10:00:01Z".into(),
    };
    let ack = engine.acknowledge_push(&batch.entries, &response).await.unwrap();
    assert_eq!(ack.removed_ids.len(), 1);
    assert_eq!(outbox::outbox_len(store.pool()).await.unwrap(), 0);

    engine.advance_cursor(&response.server_cursor, &response.server_time).await.unwrap();
    let checkpoint = synccore::store::checkpoint::get_checkpoint(store.pool()).await.unwrap();
    assert_eq!(checkpoint.last_sync_cursor.as_deref(), Some("c1"));
    assert_eq!(checkpoint.last_synced_at, Some(instant("2026-03-01T10:00:01Z")));
}

#[tokio::test]
async fn self_echo_is_ignored() {
    let now = instant("2026-03-01T10:00:00Z");
    let (store, clock, ids) = harness(now).await;
    let engine = SyncEngine::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids);

    let response = PullResponse {
        server_cursor: "c1".into(),
        server_time: "2026-03-01T10:00:01Z".into(),
        has_more: false,
        changes: vec![SyncChange {
            entity_type: EntityType::Project,
            entity_id: "p1".into(),
            operation: Operation::Upsert,
            updated_at: now,
            updated_by_device: "D1".into(),
            sync_version: 1,
            payload: json!({"name": "Alpha", "status": "ACTIVE", "created_at": now}),
            idempotency_key: "d1:1".into(),
        }],
    };

    let summary = engine.apply_pull(&response, "D1").await.unwrap();
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.skipped_self, 1);
    assert!(synccore::store::entities::get_project(store.pool(), "p1").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_title_raises_an_open_conflict_without_creating_the_task() {
    let now = instant("2026-03-02T10:00:00Z");
    let (store, clock, ids) = harness(now).await;
    let engine = SyncEngine::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());

    let response = PullResponse {
        server_cursor: "c1".into(),
        server_time: "2026-03-02T10:00:01Z".into(),
        has_more: false,
        changes: vec![SyncChange {
            entity_type: EntityType::Task,
            entity_id: "t9".into(),
            operation: Operation::Upsert,
            updated_at: now,
            updated_by_device: "D2".into(),
            sync_version: 1,
            payload: json!({"description": "x"}),
            idempotency_key: "k-9".into(),
        }],
    };

    let summary = engine.apply_pull(&response, "D1").await.unwrap();
    assert_eq!(summary.conflicts.len(), 1);
    assert_eq!(summary.conflicts[0].reason_code, "MISSING_TASK_TITLE");
    assert!(synccore::store::entities::get_task(store.pool(), "t9").await.unwrap().is_none());

    let conflict_api = ConflictApi::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids);
    let open = conflict_api.list_conflicts(Some(ConflictStatus::Open), 10).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].incoming_idempotency_key, "k-9");
}

#[tokio::test]
async fn conflict_resolves_when_a_corrected_retry_arrives_with_the_same_key() {
    let now = instant("2026-03-02T10:00:00Z");
    let (store, clock, ids) = harness(now).await;
    let engine = SyncEngine::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());

    let bad_change = SyncChange {
        entity_type: EntityType::Task,
        entity_id: "t9".into(),
        operation: Operation::Upsert,
        updated_at: now,
        updated_by_device: "D2".into(),
        sync_version: 1,
        payload: json!({"description": "x"}),
        idempotency_key: "k-9".into(),
    };
    let first = engine
        .apply_pull(&PullResponse { server_cursor: "c1".into(), server_time: "2026-03-02T10:00:01Z".into(), has_more: false, changes: vec![bad_change] }, "D1")
        .await
        .unwrap();
    assert_eq!(first.conflicts.len(), 1);

    let conflict_api = ConflictApi::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids.clone());
    let open = conflict_api.list_conflicts(Some(ConflictStatus::Open), 10).await.unwrap();
    conflict_api.resolve(&open[0].id, ResolutionStrategy::Retry, None, "D1").await.unwrap();

    clock.advance(chrono::Duration::hours(1));
    let corrected = SyncChange {
        entity_type: EntityType::Task,
        entity_id: "t9".into(),
        operation: Operation::Upsert,
        updated_at: clock.now(),
        updated_by_device: "D2".into(),
        sync_version: 2,
        payload: json!({
            "title": "Write spec",
            "status": "TODO",
            "priority": "NORMAL",
            "is_important": false,
            "recurrence": "NONE",
            "created_at": now,
        }),
        idempotency_key: "k-9".into(),
    };
    let second = engine
        .apply_pull(
            &PullResponse { server_cursor: "c2".into(), server_time: "2026-03-02T11:00:01Z".into(), has_more: false, changes: vec![corrected] },
            "D1",
        )
        .await
        .unwrap();
    assert_eq!(second.applied, 1);

    let task = synccore::store::entities::get_task(store.pool(), "t9").await.unwrap().unwrap();
    assert_eq!(task.title, "Write spec");

    let reloaded = conflict_api.list_conflicts(None, 10).await.unwrap();
    assert_eq!(reloaded[0].status, ConflictStatus::Resolved);
    assert_eq!(reloaded[0].resolution_strategy.as_deref(), Some("retry"));

    let events = synccore::store::conflicts::list_events_for_conflict(store.pool(), &reloaded[0].id, 10)
        .await
        .unwrap();
    let terminal = events
        .iter()
        .filter(|e| matches!(e.event_type, synccore::store::conflicts::ConflictEventType::Resolved | synccore::store::conflicts::ConflictEventType::Ignored))
        .count();
    assert_eq!(terminal, 1, "a conflict must accumulate at most one terminal event");
    assert!(events.iter().any(|e| e.event_type == synccore::store::conflicts::ConflictEventType::Retried));
}

#[tokio::test]
async fn lww_tie_break_favors_the_lexicographically_greater_device_id() {
    let now = instant("2026-03-03T12:00:00Z");
    let (store, clock, ids) = harness(now).await;

    let seed = SyncChange {
        entity_type: EntityType::Project,
        entity_id: "p1".into(),
        operation: Operation::Upsert,
        updated_at: now,
        updated_by_device: "ZZ".into(),
        sync_version: 1,
        payload: json!({"name": "Alpha", "status": "ACTIVE", "created_at": now}),
        idempotency_key: "zz:1".into(),
    };
    let engine = SyncEngine::new(store.clone(), clock.clone() as Arc<dyn Clock>, ids);
    engine
        .apply_pull(&PullResponse { server_cursor: "c1".into(), server_time: "2026-03-03T12:00:01Z".into(), has_more: false, changes: vec![seed] }, "D1")
        .await
        .unwrap();

    let tie = SyncChange {
        entity_type: EntityType::Project,
        entity_id: "p1".into(),
        operation: Operation::Upsert,
        updated_at: now,
        updated_by_device: "AA".into(),
        sync_version: 1,
        payload: json!({"name": "Beta", "status": "ACTIVE", "created_at": now}),
        idempotency_key: "aa:1".into(),
    };
    let summary = engine
        .apply_pull(&PullResponse { server_cursor: "c2".into(), server_time: "2026-03-03T12:00:02Z".into(), has_more: false, changes: vec![tie] }, "D1")
        .await
        .unwrap();
    assert_eq!(summary.applied, 0);
    assert_eq!(summary.skipped, 1);

    let project = synccore::store::entities::get_project(store.pool(), "p1").await.unwrap().unwrap();
    assert_eq!(project.name, "Alpha");
}

#[tokio::test]
async fn cycle_with_pagination_applies_every_page_and_advances_the_checkpoint() {
    use async_trait::async_trait;
    use synccore::runner::{RunOptions, SyncRunner};
    use synccore::transport::Transport;
    use synccore::wire::{PullRequest, PushRequest};
    use synccore::Result;

    struct PagedTransport;

    #[async_trait]
    impl Transport for PagedTransport {
        async fn push(&self, _req: &PushRequest) -> Result<PushResponse> {
            unreachable!("no outbox rows in this scenario")
        }

        async fn pull(&self, req: &PullRequest) -> Result<PullResponse> {
            let changes: Vec<SyncChange> = match req.cursor.as_deref() {
                None => (0..200)
                    .map(|i| SyncChange {
                        entity_type: EntityType::Project,
                        entity_id: format!("p{i}"),
                        operation: Operation::Upsert,
                        updated_at: Utc::now(),
                        updated_by_device: "D2".into(),
                        sync_version: 1,
                        payload: json!({"name": format!("Project {i}"), "status": "ACTIVE", "created_at": Utc::now()}),
                        idempotency_key: format!("d2:{i}"),
                    })
                    .collect(),
                Some("c2") => (200..250)
                    .map(|i| SyncChange {
                        entity_type: EntityType::Project,
                        entity_id: format!("p{i}"),
                        operation: Operation::Upsert,
                        updated_at: Utc::now(),
                        updated_by_device: "D2".into(),
                        sync_version: 1,
                        payload: json!({"name": format!("Project {i}"), "status": "ACTIVE", "created_at": Utc::now()}),
                        idempotency_key: format!("d2:{i}"),
                    })
                    .collect(),
                Some(other) => panic!("unexpected cursor {other}"),
            };
            let has_more = req.cursor.is_none();
            Ok(PullResponse {
                server_cursor: if has_more { "c2".into() } else { "c3".into() },
                server_time: Utc::now().to_rfc3339(),
                has_more,
                changes,
            })
        }
    }

    let (store, clock, ids) = harness(Utc::now()).await;
    let runner = SyncRunner::new(store.clone(), clock, ids);
    let transport = PagedTransport;
    let summary = runner.run_cycle(&transport, RunOptions::default(), &|| false).await.unwrap();

    assert_eq!(summary.checkpoint_after.as_deref(), Some("c3"));
    assert_eq!(summary.pull.applied, 250);
    assert_eq!(summary.pull.has_more, false);
}

//! runner/mod.rs - Sync Runner: drives one push/pull cycle end to end over
//! a [`Transport`], delegating the actual merge work to [`SyncEngine`]
//! (component C6).

use std::sync::Arc;

use crate::clock::Clock;
use crate::engine::{PullSummary, SyncEngine};
use crate::ids::IdGenerator;
use crate::store::{checkpoint, Store};
use crate::transport::Transport;
use crate::wire::PullRequest;
use crate::{Error, Result};

/// Per-cycle knobs. Mirrors [`crate::config::SyncConfig`]'s
/// `push_limit`/`pull_limit`/`max_pull_pages`, but a caller may override
/// them per call (e.g. a manual "sync now" with a larger `pull_limit`).
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub push_limit: u32,
    pub pull_limit: u32,
    pub skip_pull: bool,
    pub max_pull_pages: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { push_limit: 200, pull_limit: 200, skip_pull: false, max_pull_pages: 5 }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullCycleSummary {
    pub applied: u32,
    pub skipped: u32,
    pub skipped_self: u32,
    pub failed: u32,
    pub conflicts: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub device_id: String,
    pub checkpoint_before: Option<String>,
    pub checkpoint_after: Option<String>,
    pub prepared_push_changes: u32,
    pub skipped_push_changes: u32,
    pub removed_outbox_changes: u32,
    pub failed_outbox_changes: u32,
    pub pending_outbox_changes: u32,
    pub pull: PullCycleSummary,
}

pub struct SyncRunner {
    store: Store,
    engine: SyncEngine,
    ids: Arc<dyn IdGenerator>,
}

impl SyncRunner {
    pub fn new(store: Store, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        let engine = SyncEngine::new(store.clone(), clock, ids.clone());
        Self { store, engine, ids }
    }

    /// `cancel` is checked before every Transport call and between pull
    /// pages; returning `true` aborts the cycle with [`Error::CycleAborted`]
    /// once any in-flight transaction has already committed.
    pub async fn run_cycle(
        &self,
        transport: &dyn Transport,
        options: RunOptions,
        cancel: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<CycleSummary> {
        let device_id = self.store.device_id(self.ids.as_ref()).await?;
        let checkpoint_before = checkpoint::get_checkpoint(self.store.pool()).await?;

        let mut summary = CycleSummary {
            device_id: device_id.clone(),
            checkpoint_before: checkpoint_before.last_sync_cursor.clone(),
            checkpoint_after: checkpoint_before.last_sync_cursor.clone(),
            prepared_push_changes: 0,
            skipped_push_changes: 0,
            removed_outbox_changes: 0,
            failed_outbox_changes: 0,
            pending_outbox_changes: 0,
            pull: PullCycleSummary::default(),
        };

        let batch = self
            .engine
            .prepare_push(&device_id, checkpoint_before.last_sync_cursor.clone(), options.push_limit)
            .await?;
        summary.prepared_push_changes = batch.request.changes.len() as u32;
        summary.skipped_push_changes = batch.skipped.len() as u32;

        if !batch.request.changes.is_empty() {
            if cancel() {
                return Err(Error::CycleAborted { stage: "push".into(), message: "cancelled before push".into() });
            }
            let response = transport.push(&batch.request).await?;
            let ack = self.engine.acknowledge_push(&batch.entries, &response).await?;
            summary.removed_outbox_changes = ack.removed_ids.len() as u32;
            summary.failed_outbox_changes = ack.failed_ids.len() as u32;
            summary.pending_outbox_changes = ack.pending_ids.len() as u32;

            self.engine.advance_cursor(&response.server_cursor, &response.server_time).await?;
            summary.checkpoint_after = Some(response.server_cursor);
        }

        if options.skip_pull {
            return Ok(summary);
        }

        let mut cursor = checkpoint::get_checkpoint(self.store.pool()).await?.last_sync_cursor;
        for _ in 0..options.max_pull_pages {
            if cancel() {
                return Err(Error::CycleAborted { stage: "pull".into(), message: "cancelled before pull".into() });
            }

            let request = PullRequest::new(device_id.clone(), cursor.clone(), options.pull_limit);
            let response = transport.pull(&request).await?;
            let has_more = response.has_more;

            let page: PullSummary = self.engine.apply_pull(&response, &device_id).await?;
            accumulate(&mut summary.pull, &page);

            self.engine.advance_cursor(&response.server_cursor, &response.server_time).await?;
            cursor = Some(response.server_cursor.clone());
            summary.checkpoint_after = cursor.clone();
            summary.pull.has_more = has_more;

            if !has_more {
                break;
            }
        }

        Ok(summary)
    }
}

fn accumulate(total: &mut PullCycleSummary, page: &PullSummary) {
    total.applied += page.applied;
    total.skipped += page.skipped;
    total.skipped_self += page.skipped_self;
    total.failed += page.failed;
    total.conflicts += page.conflicts.len() as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ids::SequentialIdGenerator;
    use crate::mutation::{MutationApi, NewProjectInput};
    use crate::wire::{PullResponse, PushResponse};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubTransport {
        pull_calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn push(&self, req: &crate::wire::PushRequest) -> Result<PushResponse> {
            Ok(PushResponse {
                accepted: req.changes.iter().map(|c| c.idempotency_key.clone()).collect(),
                rejected: vec![],
                server_cursor: "cursor-1".into(),
                server_time: Utc::now().to_rfc3339(),
            })
        }

        async fn pull(&self, _req: &PullRequest) -> Result<PullResponse> {
            let call = self.pull_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PullResponse {
                server_cursor: format!("cursor-pull-{call}"),
                server_time: Utc::now().to_rfc3339(),
                has_more: call == 0,
                changes: vec![],
            })
        }
    }

    #[tokio::test]
    async fn run_cycle_pushes_outbox_and_paginates_pull() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let mutation = MutationApi::new(store.clone(), clock.clone(), ids.clone());
        mutation
            .create_project(NewProjectInput { name: "Alpha".into(), ..Default::default() })
            .await
            .unwrap();

        let runner = SyncRunner::new(store, clock, ids);
        let transport = StubTransport { pull_calls: AtomicUsize::new(0) };
        let summary = runner
            .run_cycle(&transport, RunOptions::default(), &|| false)
            .await
            .unwrap();

        assert_eq!(summary.prepared_push_changes, 1);
        assert_eq!(summary.removed_outbox_changes, 1);
        assert_eq!(summary.pull.has_more, false);
        assert_eq!(transport.pull_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_cycle_honors_skip_pull() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let runner = SyncRunner::new(store, clock, ids);
        let transport = StubTransport { pull_calls: AtomicUsize::new(0) };
        let options = RunOptions { skip_pull: true, ..RunOptions::default() };
        runner.run_cycle(&transport, options, &|| false).await.unwrap();
        assert_eq!(transport.pull_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_cycle_aborts_when_cancelled_before_pull() {
        let store = Store::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(Utc::now()));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIdGenerator::new("id"));
        let runner = SyncRunner::new(store, clock, ids);
        let transport = StubTransport { pull_calls: AtomicUsize::new(0) };
        let err = runner.run_cycle(&transport, RunOptions::default(), &|| true).await.unwrap_err();
        assert!(matches!(err, Error::CycleAborted { ref stage, .. } if stage == "pull"));
    }
}

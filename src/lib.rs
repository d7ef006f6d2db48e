//! synccore - Offline-first synchronization core.
//!
//! Wires together the mutation API (outbox-backed writes), the wire
//! contract (push/pull envelopes), the merge engine (last-writer-wins plus
//! conflict classification), the conflict store, the sync runner, and the
//! HTTP transport into a single embeddable library. A host application
//! owns the UI and the actual database file; this crate owns everything
//! between "the user edited a task" and "two devices agree on its state."

pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
mod error;
pub mod ids;
pub mod mutation;
pub mod runner;
pub mod store;
pub mod transport;
pub mod wire;

pub use clock::{Clock, SystemClock};
pub use config::{DeviceClass, Provider, SyncConfig};
pub use conflict::{ConflictApi, ConflictEnvelope, ConflictReport, ResolutionStrategy};
pub use engine::{PullSummary, PushSummary, SyncEngine};
pub use error::{Error, Result};
pub use ids::{IdGenerator, UuidGenerator};
pub use mutation::MutationApi;
pub use runner::{CycleSummary, RunOptions, SyncRunner};
pub use store::Store;
pub use transport::{HttpTransport, ManagedTransport, Transport};

use std::sync::Arc;

/// Convenience bundle gluing the four host-facing APIs to one opened
/// [`Store`]. A host that just wants "give me everything" constructs one
/// of these; anything wanting finer control can build the pieces directly.
pub struct SyncCore {
    pub mutation: MutationApi,
    pub conflict: ConflictApi,
    pub runner: SyncRunner,
}

impl SyncCore {
    pub fn new(store: Store, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            mutation: MutationApi::new(store.clone(), clock.clone(), ids.clone()),
            conflict: ConflictApi::new(store.clone(), clock.clone(), ids.clone()),
            runner: SyncRunner::new(store, clock, ids),
        }
    }

    /// Opens a store at `path` (or an in-memory store for `path ==
    /// ":memory:"`) and wires it with the production [`SystemClock`] and
    /// [`UuidGenerator`].
    pub async fn open(path: &str) -> Result<Self> {
        let store = if path == ":memory:" {
            Store::open_in_memory().await?
        } else {
            Store::open(std::path::Path::new(path)).await?
        };
        Ok(Self::new(store, Arc::new(SystemClock), Arc::new(UuidGenerator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sync_core_opens_in_memory_and_device_id_is_stable() {
        let core = SyncCore::open(":memory:").await.unwrap();
        let first = core.mutation.create_project(mutation::NewProjectInput {
            name: "Inbox".into(),
            ..Default::default()
        }).await.unwrap();
        assert_eq!(first.name, "Inbox");
    }
}

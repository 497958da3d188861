mod calendar;
mod coordinator;
mod error;
mod ledger;
mod scheduler;
mod store;

pub use calendar::{day_window, free_windows, merge_overlapping, subtract_intervals};
pub use coordinator::{Committed, Plan};
pub use error::{EngineError, ErrorClass};
pub use ledger::Release;
pub use scheduler::Cancellation;
pub use store::{SharedInventory, SharedVenue, Store};

use std::sync::Arc;

use tokio::sync::Mutex;

use coordinator::Coordinator;

use crate::config::EngineConfig;
use crate::identity::{Directory, IdentityResolver};
use crate::model::HolderRef;

/// The reservation engine: identity resolution, the inventory ledger and the
/// venue scheduler, all committing through one [`Coordinator`].
pub struct Engine {
    store: Arc<Store>,
    coordinator: Coordinator,
    resolver: IdentityResolver,
    config: EngineConfig,
    /// Serializes resource creation and deletion.
    catalog: Mutex<()>,
}

impl Engine {
    pub fn new(store: Arc<Store>, directory: Arc<dyn Directory>, config: EngineConfig) -> Self {
        let coordinator =
            Coordinator::new(store.clone(), config.commit_attempts, config.commit_backoff);
        Self {
            store,
            coordinator,
            resolver: IdentityResolver::new(directory),
            config,
            catalog: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Map a primary id, roll/employee number or account id to the canonical holder.
    pub fn resolve_holder(&self, candidate: &str) -> Result<HolderRef, EngineError> {
        self.resolver
            .resolve(candidate)
            .ok_or_else(|| EngineError::HolderNotFound(candidate.to_string()))
    }

    /// Rewrite the journal as the minimal set of records for the current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = self.store.begin_compaction().await;
        let records = self.store.snapshot_records().await;
        let count = records.len();
        self.store
            .journal
            .compact(records)
            .await
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))?;
        tracing::info!("journal compacted to {count} records");
        Ok(())
    }

    pub async fn journal_appends_since_compact(&self) -> u64 {
        self.store.journal.appends_since_compact().await
    }

    fn record_resource_gauge(&self) {
        metrics::gauge!(crate::observability::RESOURCES).set(self.store.resource_count() as f64);
    }
}

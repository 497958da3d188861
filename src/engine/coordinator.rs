use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::model::{CommitKey, Event, Outcome, WalRecord};
use crate::observability;

use super::EngineError;
use super::store::Store;

/// State that commit steps can be applied to and taken back from.
pub(crate) trait Stepwise {
    type Undo;

    /// Apply one step, checking its precondition. On error, self is unchanged.
    fn apply_step(&mut self, step: &Event) -> Result<Self::Undo, EngineError>;

    fn undo_step(&mut self, undo: Self::Undo);
}

/// What a plan wants committed: the steps, in order, and the result they produce.
/// No steps means the operation had already taken effect.
pub struct Plan {
    pub steps: Vec<Event>,
    pub outcome: Outcome,
}

impl Plan {
    pub fn commit(steps: Vec<Event>, outcome: Outcome) -> Self {
        Self { steps, outcome }
    }

    pub fn already_applied(outcome: Outcome) -> Self {
        Self { steps: Vec::new(), outcome }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub outcome: Outcome,
    /// True when nothing was mutated and a prior result was returned.
    pub replayed: bool,
}

/// Applies a multi-step change to one locked resource all-or-nothing and
/// journals it as a single record. Knows nothing about claims or bookings.
pub struct Coordinator {
    store: Arc<Store>,
    attempts: u32,
    backoff: Duration,
}

impl Coordinator {
    pub fn new(store: Arc<Store>, attempts: u32, backoff: Duration) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `plan` against `state` and commit its steps. The caller holds the
    /// commit gate (taken before the resource lock) and the resource's write lock.
    ///
    /// A key that was already committed returns the recorded outcome and never calls `plan`.
    pub async fn run_atomic<S, P>(
        &self,
        key: CommitKey,
        state: &mut S,
        plan: P,
    ) -> Result<Committed, EngineError>
    where
        S: Stepwise,
        P: FnOnce(&S) -> Result<Plan, EngineError>,
    {
        if let Some(prior) = self.store.commits.get(&key) {
            debug!("commit {key} already applied, returning recorded outcome");
            return Ok(Committed {
                outcome: prior.value().clone(),
                replayed: true,
            });
        }

        let Plan { steps, outcome } = plan(state)?;
        if steps.is_empty() {
            return Ok(Committed { outcome, replayed: true });
        }

        let started = Instant::now();
        let undo = apply_all(state, &steps).inspect_err(|e| {
            metrics::counter!(observability::ATOMICITY_FAILURES_TOTAL).increment(1);
            error!("commit {key} rolled back before journaling: {e}");
        })?;

        let record = WalRecord {
            key: Some(key),
            steps,
            outcome,
        };
        if let Err(e) = self.append_with_retry(&record).await {
            rollback(state, undo);
            metrics::counter!(observability::ATOMICITY_FAILURES_TOTAL).increment(1);
            error!("commit {key} rolled back, journal unavailable: {e}");
            return Err(EngineError::EngineUnavailable(e.to_string()));
        }

        for step in &record.steps {
            self.store.index_step(step);
        }
        self.store.commits.insert(key, record.outcome.clone());
        metrics::histogram!(observability::COMMIT_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        Ok(Committed {
            outcome: record.outcome,
            replayed: false,
        })
    }

    /// Journal a catalog change that has no idempotency key. The caller holds
    /// the commit gate and applies the change to the store after this returns Ok.
    pub async fn persist(&self, steps: Vec<Event>) -> Result<(), EngineError> {
        let record = WalRecord {
            key: None,
            steps,
            outcome: Outcome::Applied,
        };
        self.append_with_retry(&record)
            .await
            .map_err(|e| EngineError::EngineUnavailable(e.to_string()))
    }

    /// Apply and journal catalog steps on an existing resource, all-or-nothing.
    pub async fn apply_unkeyed<S: Stepwise>(
        &self,
        state: &mut S,
        steps: Vec<Event>,
    ) -> Result<(), EngineError> {
        let undo = apply_all(state, &steps)?;
        if let Err(e) = self.persist(steps).await {
            rollback(state, undo);
            return Err(e);
        }
        Ok(())
    }

    async fn append_with_retry(&self, record: &WalRecord) -> std::io::Result<()> {
        let mut attempt = 1;
        loop {
            match self.store.journal.append(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.attempts => {
                    warn!("journal append failed (attempt {attempt}/{}): {e}", self.attempts);
                    metrics::counter!(observability::COMMIT_RETRIES_TOTAL).increment(1);
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Apply every step or none: on the first failure, undo what was applied.
pub(super) fn apply_all<S: Stepwise>(
    state: &mut S,
    steps: &[Event],
) -> Result<Vec<S::Undo>, EngineError> {
    let mut undo = Vec::with_capacity(steps.len());
    for step in steps {
        match state.apply_step(step) {
            Ok(u) => undo.push(u),
            Err(e) => {
                rollback(state, undo);
                return Err(e);
            }
        }
    }
    Ok(undo)
}

fn rollback<S: Stepwise>(state: &mut S, undo: Vec<S::Undo>) {
    for u in undo.into_iter().rev() {
        state.undo_step(u);
    }
}

//! Result write path and the per-run aggregate it maintains.
//!
//! Every write goes through [`ResultIngestor`], which persists the row and then
//! hands the change to [`AggregateMaintainer`]. Counters therefore always equal
//! a replay of the surviving rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use tboard_core::types::{
    CabinetId, CounterDelta, NewResult, ResultId, ResultRecord, RunId, ShardCompletion,
    ShardState,
};
use tboard_observe::time::unix_time_ms;
use tboard_store::{RunStore, StoreError};
use tboard_wire::{EndTboardCall, EndTboardRequest, TryToCore};

use crate::coordinator::Coordinator;
use crate::error::IngestError;
use crate::metrics::CoordinatorMetrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultChange {
    Created(ResultRecord),
    Updated {
        before: ResultRecord,
        after: ResultRecord,
    },
    Deleted(ResultRecord),
}

/// Counter deltas a change implies, per affected run. Zero deltas are dropped.
///
/// A re-parented record is removed from its old run before it is added to
/// the new one.
pub fn counter_deltas(change: &ResultChange) -> Vec<(RunId, CounterDelta)> {
    let deltas = match change {
        ResultChange::Created(r) => vec![(r.run_id, r.outcome().weight())],
        ResultChange::Deleted(r) => vec![(r.run_id, r.outcome().weight().negate())],
        ResultChange::Updated { before, after } if before.run_id != after.run_id => vec![
            (before.run_id, before.outcome().weight().negate()),
            (after.run_id, after.outcome().weight()),
        ],
        ResultChange::Updated { before, after } => {
            let old = before.outcome().weight();
            let new = after.outcome().weight();
            vec![(
                after.run_id,
                CounterDelta {
                    total: new.total - old.total,
                    success: new.success - old.success,
                },
            )]
        }
    };
    deltas.into_iter().filter(|(_, d)| !d.is_zero()).collect()
}

/// Folds result changes into run counters.
#[derive(Clone)]
pub struct AggregateMaintainer {
    store: Arc<dyn RunStore>,
}

impl AggregateMaintainer {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub fn apply(&self, change: &ResultChange) -> Result<(), StoreError> {
        for (run_id, delta) in counter_deltas(change) {
            match self.store.apply_result_delta(run_id, delta) {
                Ok(ratio) => {
                    tracing::debug!(run_id = %run_id, ?delta, ?ratio, "aggregate updated");
                }
                // The run is being deleted; its counters no longer matter.
                Err(StoreError::RunNotFound(_)) => {
                    tracing::warn!(run_id = %run_id, ?delta, "aggregate target run is gone");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ResultIngestor {
    store: Arc<dyn RunStore>,
    aggregate: AggregateMaintainer,
    metrics: Arc<CoordinatorMetrics>,
}

impl ResultIngestor {
    pub fn new(store: Arc<dyn RunStore>, metrics: Arc<CoordinatorMetrics>) -> Self {
        Self {
            aggregate: AggregateMaintainer::new(store.clone()),
            store,
            metrics,
        }
    }

    pub fn create(&self, new: NewResult) -> Result<ResultRecord, IngestError> {
        let record = self.store.insert_result(new)?;
        self.metrics.results_ingested_total.inc();
        self.aggregate.apply(&ResultChange::Created(record.clone()))?;
        Ok(record)
    }

    /// Replaces a row. Once a row has an end time only its run and
    /// assessment may change.
    pub fn update(&self, record: ResultRecord) -> Result<ResultRecord, IngestError> {
        let before = match self.store.update_result(record.clone()) {
            Ok(before) => before,
            Err(StoreError::ResultImmutable(id)) => return Err(IngestError::Immutable(id)),
            Err(err) => return Err(err.into()),
        };
        self.metrics.results_ingested_total.inc();
        self.aggregate.apply(&ResultChange::Updated {
            before,
            after: record.clone(),
        })?;
        Ok(record)
    }

    pub fn reparent(&self, id: ResultId, run_id: RunId) -> Result<ResultRecord, IngestError> {
        let mut record = self.store.get_result(id)?;
        record.run_id = run_id;
        self.update(record)
    }

    pub fn delete(&self, id: ResultId) -> Result<ResultRecord, IngestError> {
        let removed = self.store.remove_result(id)?;
        self.aggregate.apply(&ResultChange::Deleted(removed.clone()))?;
        Ok(removed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOfRunOutcome {
    /// Cabinets moved from `Running` to the reported state.
    pub applied: Vec<CabinetId>,
    /// Cabinets already terminal or not part of the run.
    pub ignored: Vec<CabinetId>,
    pub released: usize,
    pub finalized: bool,
}

impl Coordinator {
    /// Applies an agent's end-of-run report.
    ///
    /// Repeated reports are harmless: shard transitions are CAS from `Running`
    /// and finalization happens at most once.
    pub fn end_of_run(&self, completion: ShardCompletion) -> Result<EndOfRunOutcome, IngestError> {
        let run = self.store.get_run(completion.run_id)?;
        let plan = self.shard_devices(&run)?;
        let mut outcome = EndOfRunOutcome::default();

        for (cabinet_id, state) in &completion.updates {
            let swapped = self.store.compare_and_set_shard_status(
                run.id,
                cabinet_id,
                ShardState::Running,
                *state,
            )?;
            if !swapped {
                tracing::debug!(
                    run_id = %run.id,
                    cabinet_id = %cabinet_id,
                    "completion for a shard that is not running; ignored"
                );
                outcome.ignored.push(cabinet_id.clone());
                continue;
            }
            self.metrics.shard_completions_total.inc();
            tracing::info!(
                target: "tboard_proof",
                event = "shard_completed",
                run_id = %run.id,
                cabinet_id = %cabinet_id,
                state = ?state,
                "shard reported terminal state"
            );
            outcome.released += self
                .release_shard(run.id, cabinet_id, plan.get(cabinet_id))?
                .len();
            outcome.applied.push(cabinet_id.clone());
        }

        let end_time_ms = completion.end_time_ms.unwrap_or_else(unix_time_ms);
        outcome.finalized = self.finalize(run.id, end_time_ms)?;
        Ok(outcome)
    }

    /// Entry point for the `PUT /end_tboard/{run_id}/` callback body.
    pub fn end_of_run_from_wire(
        &self,
        run_id: RunId,
        body: &EndTboardRequest,
    ) -> Result<EndOfRunOutcome, IngestError> {
        let completion = EndTboardCall { run_id, body }.try_to_core()?;
        self.end_of_run(completion)
    }
}

/// Counters recomputed from scratch, for comparison against the maintained
/// ones.
pub fn replay_counters(records: &[ResultRecord]) -> BTreeMap<RunId, CounterDelta> {
    let mut out: BTreeMap<RunId, CounterDelta> = BTreeMap::new();
    for r in records {
        let w = r.outcome().weight();
        let entry = out.entry(r.run_id).or_default();
        entry.total += w.total;
        entry.success += w.success;
    }
    out
}

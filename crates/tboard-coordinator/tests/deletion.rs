mod common;

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{dev, harness, job, request};
use tboard_coordinator::deletion::{
    group_for_owner, ArtifactStore, DeletionPipeline, DeletionWorker, LedgerUpdate, NoArtifacts,
};
use tboard_coordinator::metrics::CoordinatorMetrics;
use tboard_coordinator::{DeletionConfig, DeletionError, EnqueueOutcome};
use tboard_core::deletion::DeletionState;
use tboard_core::types::{Assessment, NewResult, RunId};
use tboard_store::{LedgerKv, MemLedgerKv, MemRunStore, RunStore, StoreError};
use tokio::sync::broadcast;

/// Fails the first `failures` cleanups, then succeeds.
struct FlakyArtifacts {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyArtifacts {
    fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

impl ArtifactStore for FlakyArtifacts {
    fn remove_run_artifacts(&self, _run_id: RunId) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "share is read-only"));
        }
        Ok(())
    }
}

struct Fixture {
    store: Arc<MemRunStore>,
    kv: Arc<MemLedgerKv>,
    metrics: Arc<CoordinatorMetrics>,
    pipeline: DeletionPipeline,
    worker: Option<DeletionWorker>,
    run_id: RunId,
}

fn config(max_retries: u32) -> DeletionConfig {
    DeletionConfig {
        max_retries,
        retry_backoff: Duration::from_millis(1),
        ..DeletionConfig::default()
    }
}

async fn fixture(artifacts: Arc<dyn ArtifactStore>, cfg: DeletionConfig) -> Result<Fixture> {
    let h = harness()?;
    let run_id = h
        .coordinator
        .dispatch(request(&["a1"], &["j1"]))
        .await?
        .run()
        .run_id;
    let ingest = h.coordinator.ingestor();
    for assessment in [Assessment::Success, Assessment::Fail] {
        ingest.create(NewResult {
            run_id,
            device: dev("a1"),
            job: job("j1"),
            start_time_ms: 1,
            end_time_ms: Some(2),
            assessment: Some(assessment),
        })?;
    }

    let kv = Arc::new(MemLedgerKv::new());
    let (pipeline, worker) =
        DeletionPipeline::new(h.store.clone(), kv.clone(), artifacts, cfg, h.metrics.clone());
    Ok(Fixture {
        store: h.store,
        kv,
        metrics: h.metrics,
        pipeline,
        worker: Some(worker),
        run_id,
    })
}

impl Fixture {
    fn start_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            tokio::spawn(worker.run());
        }
    }
}

async fn next_update(rx: &mut broadcast::Receiver<Arc<LedgerUpdate>>) -> Result<Arc<LedgerUpdate>> {
    Ok(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await??)
}

fn active_state(update: &LedgerUpdate, run_id: RunId) -> Option<DeletionState> {
    update
        .snapshot
        .active
        .iter()
        .find(|t| t.run_id == run_id)
        .map(|t| t.state)
}

#[tokio::test]
async fn deletion_walks_every_state_and_broadcasts_each() -> Result<()> {
    let mut fx = fixture(Arc::new(NoArtifacts), config(3)).await?;
    let mut rx = fx.pipeline.subscribe("qa");
    let mut other = fx.pipeline.subscribe("ops");
    fx.start_worker();

    let queued = fx.pipeline.enqueue(fx.run_id).await?;
    assert_eq!(queued, EnqueueOutcome::Queued { retried: false });

    let mut seen = Vec::new();
    for _ in 0..3 {
        let update = next_update(&mut rx).await?;
        assert_eq!(update.group, group_for_owner("qa"));
        assert_eq!(update.run_id, fx.run_id);
        seen.push(active_state(&update, fx.run_id));
    }
    assert_eq!(
        seen,
        vec![
            Some(DeletionState::ToDelete),
            Some(DeletionState::Deleting),
            Some(DeletionState::Deleted),
        ]
    );
    assert!(other.try_recv().is_err());

    assert_eq!(
        fx.store.get_run(fx.run_id).unwrap_err(),
        StoreError::RunNotFound(fx.run_id)
    );
    assert!(fx.store.results_for_run(fx.run_id)?.is_empty());

    let ttl = fx.kv.ttl(&format!("run:delete:{}", fx.run_id))?;
    let ttl = ttl.ok_or_else(|| anyhow::anyhow!("deleted ticket has no expiry"))?;
    assert!(ttl <= Duration::from_secs(24 * 60 * 60));
    assert!(ttl > Duration::from_secs(23 * 60 * 60));

    assert_eq!(fx.metrics.deletions_completed_total.get(), 1);
    assert_eq!(fx.metrics.ledger_broadcasts_total.get(), 3);
    assert_eq!(fx.metrics.deletions_in_flight.get(), 0);
    Ok(())
}

#[tokio::test]
async fn exhausted_retries_land_in_the_failure_ledger() -> Result<()> {
    let artifacts = Arc::new(FlakyArtifacts::new(u32::MAX));
    let mut fx = fixture(artifacts.clone(), config(2)).await?;
    let mut rx = fx.pipeline.subscribe("qa");
    fx.start_worker();

    fx.pipeline.enqueue(fx.run_id).await?;
    next_update(&mut rx).await?;
    next_update(&mut rx).await?;
    let last = next_update(&mut rx).await?;

    assert_eq!(active_state(&last, fx.run_id), None);
    assert_eq!(last.snapshot.failed.len(), 1);
    assert_eq!(last.snapshot.failed[0].run_id, fx.run_id);
    assert_eq!(artifacts.calls.load(Ordering::SeqCst), 3);

    let run = fx.store.get_run(fx.run_id)?;
    assert!(run.marked_for_deletion);
    assert_eq!(fx.metrics.deletions_failed_total.get(), 1);
    Ok(())
}

#[tokio::test]
async fn re_enqueue_clears_the_failed_ticket() -> Result<()> {
    let artifacts = Arc::new(FlakyArtifacts::new(1));
    let mut fx = fixture(artifacts, config(0)).await?;
    let mut rx = fx.pipeline.subscribe("qa");
    fx.start_worker();

    fx.pipeline.enqueue(fx.run_id).await?;
    for _ in 0..3 {
        next_update(&mut rx).await?;
    }
    assert!(fx.pipeline.ledger().get_failed(fx.run_id)?.is_some());

    let again = fx.pipeline.enqueue(fx.run_id).await?;
    assert_eq!(again, EnqueueOutcome::Queued { retried: true });
    let first = next_update(&mut rx).await?;
    assert!(first.snapshot.failed.is_empty());
    assert_eq!(active_state(&first, fx.run_id), Some(DeletionState::ToDelete));

    next_update(&mut rx).await?;
    let done = next_update(&mut rx).await?;
    assert_eq!(active_state(&done, fx.run_id), Some(DeletionState::Deleted));
    assert!(fx.pipeline.ledger_snapshot()?.failed.is_empty());
    Ok(())
}

#[tokio::test]
async fn enqueue_is_idempotent_while_pending() -> Result<()> {
    let fx = fixture(Arc::new(NoArtifacts), config(0)).await?;

    let first = fx.pipeline.enqueue(fx.run_id).await?;
    let second = fx.pipeline.enqueue(fx.run_id).await?;
    assert_eq!(first, EnqueueOutcome::Queued { retried: false });
    assert_eq!(second, EnqueueOutcome::AlreadyQueued);

    let snapshot = fx.pipeline.ledger_snapshot()?;
    assert_eq!(snapshot.active.len(), 1);
    assert_eq!(snapshot.active[0].state, DeletionState::ToDelete);
    assert_eq!(snapshot.active[0].owner, "qa");
    assert!(fx.store.get_run(fx.run_id)?.marked_for_deletion);
    Ok(())
}

#[tokio::test]
async fn enqueue_reports_missing_run_and_stopped_worker() -> Result<()> {
    let mut fx = fixture(Arc::new(NoArtifacts), config(0)).await?;

    let err = fx.pipeline.enqueue(RunId(9_999)).await.unwrap_err();
    assert!(matches!(
        err,
        DeletionError::Store(StoreError::RunNotFound(RunId(9_999)))
    ));

    let mut rx = fx.pipeline.subscribe("qa");
    drop(fx.worker.take());
    let err = fx.pipeline.enqueue(fx.run_id).await.unwrap_err();
    assert!(matches!(err, DeletionError::WorkerStopped));

    // The orphaned ticket is parked as failed, not left active.
    let snapshot = fx.pipeline.ledger_snapshot()?;
    assert!(snapshot.active.is_empty());
    assert_eq!(snapshot.failed.len(), 1);
    assert_eq!(snapshot.failed[0].run_id, fx.run_id);
    next_update(&mut rx).await?;
    let parked = next_update(&mut rx).await?;
    assert_eq!(active_state(&parked, fx.run_id), None);
    assert_eq!(parked.snapshot.failed.len(), 1);

    // A fresh pipeline over the same ledger can take the run again.
    let (pipeline, worker) = DeletionPipeline::new(
        fx.store.clone(),
        fx.kv.clone(),
        Arc::new(NoArtifacts),
        config(0),
        fx.metrics.clone(),
    );
    tokio::spawn(worker.run());
    assert_eq!(
        pipeline.enqueue(fx.run_id).await?,
        EnqueueOutcome::Queued { retried: true }
    );
    Ok(())
}

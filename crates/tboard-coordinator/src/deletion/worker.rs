use std::io;
use std::sync::Arc;

use tboard_core::deletion::{DeletionState, DeletionTicket};
use tboard_core::types::RunId;
use tboard_observe::time::unix_time_ms;
use tboard_store::{LedgerKv, RunStore, StoreError};
use tokio::sync::{broadcast, mpsc};

use super::artifacts::ArtifactStore;
use super::ledger::{DeletionLedger, LedgerSnapshot};
use super::notify::{group_for_owner, LedgerUpdate, NotificationHub};
use crate::config::DeletionConfig;
use crate::error::DeletionError;
use crate::metrics::CoordinatorMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// `retried` is set when a failed ticket for the run was cleared first.
    Queued { retried: bool },
    AlreadyQueued,
}

struct Inner {
    store: Arc<dyn RunStore>,
    ledger: DeletionLedger,
    hub: NotificationHub,
    artifacts: Arc<dyn ArtifactStore>,
    config: DeletionConfig,
    metrics: Arc<CoordinatorMetrics>,
}

/// Handle for requesting run deletions and watching their progress.
///
/// The paired [`DeletionWorker`] stops once every handle is dropped.
#[derive(Clone)]
pub struct DeletionPipeline {
    inner: Arc<Inner>,
    queue: mpsc::Sender<RunId>,
}

pub struct DeletionWorker {
    inner: Arc<Inner>,
    queue: mpsc::Receiver<RunId>,
}

impl DeletionPipeline {
    pub fn new(
        store: Arc<dyn RunStore>,
        kv: Arc<dyn LedgerKv>,
        artifacts: Arc<dyn ArtifactStore>,
        config: DeletionConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> (Self, DeletionWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let inner = Arc::new(Inner {
            store,
            ledger: DeletionLedger::new(kv),
            hub: NotificationHub::new(config.broadcast_capacity),
            artifacts,
            config,
            metrics,
        });
        (
            Self {
                inner: inner.clone(),
                queue: tx,
            },
            DeletionWorker { inner, queue: rx },
        )
    }

    pub fn ledger(&self) -> &DeletionLedger {
        &self.inner.ledger
    }

    pub fn ledger_snapshot(&self) -> Result<LedgerSnapshot, DeletionError> {
        Ok(self.inner.ledger.snapshot()?)
    }

    pub fn subscribe(&self, owner: &str) -> broadcast::Receiver<Arc<LedgerUpdate>> {
        self.inner.hub.subscribe(&group_for_owner(owner))
    }

    /// Marks the run for deletion and queues it for the worker.
    pub async fn enqueue(&self, run_id: RunId) -> Result<EnqueueOutcome, DeletionError> {
        let run = self.inner.store.get_run(run_id)?;
        if let Some(ticket) = self.inner.ledger.get(run_id)? {
            if ticket.state != DeletionState::Deleted {
                tracing::debug!(run_id = %run_id, state = %ticket.state, "deletion already queued");
                return Ok(EnqueueOutcome::AlreadyQueued);
            }
        }

        let retried = self.inner.ledger.remove_failed(run_id)?;
        self.inner.store.set_marked_for_deletion(run_id, true)?;
        let ticket = DeletionTicket::for_run(&run, unix_time_ms());
        self.inner.ledger.put(&ticket)?;
        self.inner.metrics.deletions_enqueued_total.inc();
        tracing::info!(
            target: "tboard_proof",
            event = "deletion_enqueued",
            run_id = %run_id,
            retried,
            "run queued for deletion"
        );
        self.inner.broadcast(&run.owner, run_id);

        if self.queue.send(run_id).await.is_err() {
            // Nothing will pick the ticket up; park it where a later enqueue
            // can retry it.
            self.inner
                .ledger
                .move_to_failed(&ticket.into_failed(unix_time_ms()))?;
            self.inner.metrics.deletions_failed_total.inc();
            tracing::error!(
                target: "tboard_proof",
                event = "deletion_failed",
                run_id = %run_id,
                "deletion worker is gone; run moved to the failure ledger"
            );
            self.inner.broadcast(&run.owner, run_id);
            return Err(DeletionError::WorkerStopped);
        }
        Ok(EnqueueOutcome::Queued { retried })
    }
}

impl DeletionWorker {
    /// Processes queued deletions one at a time until every pipeline handle
    /// is gone.
    pub async fn run(mut self) {
        while let Some(run_id) = self.queue.recv().await {
            if let Err(err) = self.inner.process(run_id).await {
                tracing::error!(run_id = %run_id, error = %err, "deletion job failed");
            }
        }
        tracing::info!("deletion worker stopped");
    }
}

impl Inner {
    fn broadcast(&self, owner: &str, run_id: RunId) {
        let snapshot = match self.ledger.snapshot() {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "ledger snapshot failed; update dropped");
                return;
            }
        };
        self.metrics.ledger_broadcasts_total.inc();
        self.hub.publish(LedgerUpdate {
            group: group_for_owner(owner),
            run_id,
            snapshot,
        });
    }

    async fn process(&self, run_id: RunId) -> Result<(), DeletionError> {
        let Some(ticket) = self.ledger.get(run_id)? else {
            tracing::warn!(run_id = %run_id, "queued deletion has no ledger ticket; skipped");
            return Ok(());
        };
        let ticket = ticket.with_state(DeletionState::Deleting, unix_time_ms());
        self.ledger.put(&ticket)?;
        self.broadcast(&ticket.owner, run_id);

        self.metrics.deletions_in_flight.inc();
        let result = self.delete_with_retries(run_id).await;
        self.metrics.deletions_in_flight.dec();

        match result {
            Ok(()) => {
                let ticket = ticket.with_state(DeletionState::Deleted, unix_time_ms());
                self.ledger.put(&ticket)?;
                self.ledger.expire(run_id, self.config.ticket_ttl)?;
                self.metrics.deletions_completed_total.inc();
                tracing::info!(
                    target: "tboard_proof",
                    event = "run_deleted",
                    run_id = %run_id,
                    "run deleted"
                );
                self.broadcast(&ticket.owner, run_id);
            }
            Err(err) => {
                let owner = ticket.owner.clone();
                self.ledger.move_to_failed(&ticket.into_failed(unix_time_ms()))?;
                self.metrics.deletions_failed_total.inc();
                tracing::error!(
                    target: "tboard_proof",
                    event = "deletion_failed",
                    run_id = %run_id,
                    error = %err,
                    "deletion moved to the failure ledger"
                );
                self.broadcast(&owner, run_id);
            }
        }
        Ok(())
    }

    async fn delete_with_retries(&self, run_id: RunId) -> Result<(), DeletionError> {
        let attempts = self.config.max_retries.saturating_add(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.delete_once(run_id).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(
                        run_id = %run_id,
                        attempt,
                        attempts,
                        error = %err,
                        "deletion attempt failed"
                    );
                    last_error = err.to_string();
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_backoff).await;
            }
        }
        Err(DeletionError::RetryExhausted {
            run_id,
            attempts,
            last_error,
        })
    }

    /// Results, then artifacts, then the run row. Safe to repeat.
    async fn delete_once(&self, run_id: RunId) -> Result<(), DeletionError> {
        let removed = self.store.delete_results_for_run(run_id)?;
        tracing::debug!(run_id = %run_id, removed, "result records deleted");

        let artifacts = self.artifacts.clone();
        tokio::task::spawn_blocking(move || artifacts.remove_run_artifacts(run_id))
            .await
            .map_err(io::Error::other)??;

        match self.store.delete_run(run_id) {
            Ok(()) | Err(StoreError::RunNotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

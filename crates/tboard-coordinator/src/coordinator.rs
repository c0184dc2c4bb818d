use std::collections::BTreeSet;
use std::sync::Arc;

use tboard_core::types::{CabinetId, DeviceId, RunId, ShardPlan, TestRun};
use tboard_store::{DeviceDirectory, RunStore, StoreError};

use crate::agent::{AgentClient, AgentGateway, AuditTrail};
use crate::config::CoordinatorConfig;
use crate::ingest::ResultIngestor;
use crate::metrics::CoordinatorMetrics;

/// Entry point for run dispatch, cancellation, and agent completion callbacks.
///
/// Operations live in `dispatch`, `cancel`, and `ingest`; this type only holds
/// the injected collaborators.
#[derive(Clone)]
pub struct Coordinator {
    pub(crate) store: Arc<dyn RunStore>,
    pub(crate) directory: Arc<dyn DeviceDirectory>,
    pub(crate) agents: AgentGateway,
    pub(crate) config: CoordinatorConfig,
    pub(crate) metrics: Arc<CoordinatorMetrics>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn RunStore>,
        directory: Arc<dyn DeviceDirectory>,
        agent: Arc<dyn AgentClient>,
        config: CoordinatorConfig,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let audit = Arc::new(AuditTrail::new(config.audit_capacity));
        Self {
            store,
            directory,
            agents: AgentGateway::new(agent, audit, metrics.clone()),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    pub fn audit(&self) -> &AuditTrail {
        self.agents.audit()
    }

    pub fn run(&self, id: RunId) -> Result<TestRun, StoreError> {
        self.store.get_run(id)
    }

    pub fn ingestor(&self) -> ResultIngestor {
        ResultIngestor::new(self.store.clone(), self.metrics.clone())
    }

    /// Current devices of `run` grouped by owning cabinet. Devices no longer
    /// in the directory are left out.
    pub(crate) fn shard_devices(&self, run: &TestRun) -> Result<ShardPlan, StoreError> {
        let mut plan = ShardPlan::new();
        for device_id in &run.devices {
            match self.directory.device(device_id) {
                Ok(device) => {
                    plan.entry(device.cabinet).or_default().insert(device_id.clone());
                }
                Err(StoreError::DeviceNotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(plan)
    }

    /// Releases a finished shard's devices that are still claimed by `run_id`.
    pub(crate) fn release_shard(
        &self,
        run_id: RunId,
        cabinet_id: &CabinetId,
        devices: Option<&BTreeSet<DeviceId>>,
    ) -> Result<Vec<DeviceId>, StoreError> {
        let Some(devices) = devices else {
            return Ok(Vec::new());
        };
        let released = self.store.release_devices_if_owned(run_id, devices)?;
        let skipped = devices.len().saturating_sub(released.len());
        self.metrics
            .devices_released_total
            .inc_by(released.len() as u64);
        self.metrics.stale_claims_skipped_total.inc_by(skipped as u64);
        if skipped > 0 {
            tracing::info!(
                run_id = %run_id,
                cabinet_id = %cabinet_id,
                skipped,
                "devices claimed by a newer run or not busy; left untouched"
            );
        }
        Ok(released)
    }

    pub(crate) fn finalize(&self, run_id: RunId, end_time_ms: u64) -> Result<bool, StoreError> {
        let finalized = self.store.finalize_if_all_done(run_id, end_time_ms)?;
        if finalized {
            self.metrics.runs_finalized_total.inc();
            tracing::info!(
                target: "tboard_proof",
                event = "run_finalized",
                run_id = %run_id,
                end_time_ms,
                "run finished"
            );
        }
        Ok(finalized)
    }
}

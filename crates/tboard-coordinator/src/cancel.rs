use std::collections::BTreeMap;

use tboard_core::types::{CabinetId, RunId, ShardState};
use tboard_observe::time::unix_time_ms;
use tboard_store::StoreError;
use tboard_wire::remove_tboard_path;

use crate::agent::{AgentMethod, AgentRequest, ShardTransportError};
use crate::coordinator::Coordinator;
use crate::error::CancelError;
use crate::fanout;

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// Every running shard stopped (or none was running). The run is finished.
    Success { stopped: Vec<CabinetId> },
    /// Some shards stopped; the rest stay `Running` and the run stays open.
    Partial {
        stopped: Vec<CabinetId>,
        failed: BTreeMap<CabinetId, ShardTransportError>,
    },
    /// No shard acknowledged the stop. Nothing changed.
    AllFailed {
        failed: BTreeMap<CabinetId, ShardTransportError>,
    },
}

impl Coordinator {
    /// Best-effort stop of every running shard of `run_id`.
    ///
    /// A shard whose agent does not acknowledge stays `Running`; the run is
    /// never force-finished.
    pub async fn cancel(&self, run_id: RunId) -> Result<CancelOutcome, CancelError> {
        self.metrics.cancel_total.inc();
        let run = self.store.get_run(run_id)?;
        let running = run.running_cabinets();
        if running.is_empty() {
            self.finalize(run_id, unix_time_ms())?;
            return Ok(CancelOutcome::Success {
                stopped: Vec::new(),
            });
        }

        let mut failed = BTreeMap::new();
        let mut calls = Vec::with_capacity(running.len());
        for cabinet_id in running {
            match self.directory.cabinet(&cabinet_id) {
                Ok(cabinet) => calls.push((
                    cabinet_id,
                    AgentRequest {
                        method: AgentMethod::Delete,
                        endpoint: cabinet.endpoint,
                        path: remove_tboard_path(run_id),
                        body: None,
                    },
                )),
                Err(StoreError::CabinetNotFound(_)) => {
                    failed.insert(
                        cabinet_id,
                        ShardTransportError::Request("cabinet has no endpoint".to_string()),
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        let attempted: Vec<CabinetId> = calls.iter().map(|(c, _)| c.clone()).collect();

        let timeout = self.config.stop_timeout;
        let mut results = fanout::per_cabinet(self.config.dispatch_concurrency, calls, |c, r| {
            let agents = self.agents.clone();
            async move { agents.call(&c, r, timeout).await }
        })
        .await;

        let plan = self.shard_devices(&run)?;
        let mut stopped = Vec::new();
        for cabinet_id in attempted {
            let resp = match results.remove(&cabinet_id) {
                Some(Ok(resp)) => resp,
                Some(Err(err)) => {
                    failed.insert(cabinet_id, err);
                    continue;
                }
                None => {
                    failed.insert(
                        cabinet_id,
                        ShardTransportError::Request("stop task aborted".to_string()),
                    );
                    continue;
                }
            };

            // A completion callback may have landed while the stop was in flight.
            let swapped = self.store.compare_and_set_shard_status(
                run_id,
                &cabinet_id,
                ShardState::Running,
                ShardState::Done,
            )?;
            if let Some(snapshot) = resp.body {
                self.store
                    .record_agent_snapshot(run_id, &cabinet_id, snapshot)?;
            }
            if swapped {
                self.release_shard(run_id, &cabinet_id, plan.get(&cabinet_id))?;
            }
            tracing::info!(
                target: "tboard_proof",
                event = "shard_stopped",
                run_id = %run_id,
                cabinet_id = %cabinet_id,
                "shard stopped"
            );
            stopped.push(cabinet_id);
        }

        for (cabinet_id, err) in &failed {
            tracing::warn!(
                target: "tboard_proof",
                event = "shard_stop_failed",
                run_id = %run_id,
                cabinet_id = %cabinet_id,
                error = %err,
                "shard did not acknowledge stop; left running"
            );
        }

        if stopped.is_empty() {
            return Ok(CancelOutcome::AllFailed { failed });
        }
        self.finalize(run_id, unix_time_ms())?;
        if failed.is_empty() {
            Ok(CancelOutcome::Success { stopped })
        } else {
            Ok(CancelOutcome::Partial { stopped, failed })
        }
    }
}

use std::collections::{BTreeMap, BTreeSet};

use tboard_core::types::{
    CabinetId, Device, DeviceId, JobId, JobSpec, NewRun, RunId, RunMetadata, ShardPlan,
    ShardState,
};
use tboard_observe::time::unix_time_ms;
use tboard_store::StoreError;
use tboard_wire::{ShardPayload, ToWire, INSERT_TBOARD_PATH};

use crate::agent::{AgentMethod, AgentRequest, ShardTransportError};
use crate::coordinator::Coordinator;
use crate::error::{DispatchError, ValidationError};
use crate::fanout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub devices: BTreeSet<DeviceId>,
    pub jobs: Vec<JobId>,
    pub repeat_count: u32,
    pub metadata: RunMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    pub run_id: RunId,
    /// Shards the agents accepted.
    pub shards: ShardPlan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Accepted(RunHandle),
    /// The run exists for the accepted shards only.
    Partial {
        run: RunHandle,
        failed: BTreeMap<CabinetId, ShardTransportError>,
    },
}

impl DispatchOutcome {
    pub fn run(&self) -> &RunHandle {
        match self {
            DispatchOutcome::Accepted(run) => run,
            DispatchOutcome::Partial { run, .. } => run,
        }
    }

    pub fn failed_cabinets(&self) -> Vec<CabinetId> {
        match self {
            DispatchOutcome::Accepted(_) => Vec::new(),
            DispatchOutcome::Partial { failed, .. } => failed.keys().cloned().collect(),
        }
    }
}

/// Groups devices by owning cabinet. Every device lands in exactly one shard
/// and no shard is empty.
pub fn partition_shards<I>(placements: I) -> ShardPlan
where
    I: IntoIterator<Item = (DeviceId, CabinetId)>,
{
    let mut plan = ShardPlan::new();
    for (device_id, cabinet_id) in placements {
        plan.entry(cabinet_id).or_default().insert(device_id);
    }
    plan
}

struct Validated {
    devices: Vec<Device>,
    jobs: Vec<JobSpec>,
    endpoints: BTreeMap<CabinetId, String>,
}

impl Coordinator {
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchOutcome, DispatchError> {
        self.metrics.dispatch_total.inc();
        let validated = match self.validate(&req) {
            Ok(v) => v,
            Err(err) => {
                self.metrics.dispatch_rejected_total.inc();
                return Err(err);
            }
        };

        let shards = partition_shards(
            validated
                .devices
                .iter()
                .map(|d| (d.id.clone(), d.cabinet.clone())),
        );
        let run = self.store.create_run(NewRun {
            metadata: req.metadata,
            jobs: req.jobs,
            repeat_count: req.repeat_count,
            shards: shards.clone(),
            created_at_ms: unix_time_ms(),
        })?;
        tracing::info!(
            target: "tboard_proof",
            event = "run_created",
            run_id = %run.id,
            shards = shards.len(),
            devices = run.devices.len(),
            "run persisted; dispatching shards"
        );

        let mut calls = Vec::with_capacity(shards.len());
        let mut failures = BTreeMap::new();
        for (cabinet_id, devices) in &shards {
            let payload = ShardPayload {
                run: &run,
                jobs: &validated.jobs,
                devices,
            }
            .to_wire();
            let Some(endpoint) = validated.endpoints.get(cabinet_id) else {
                failures.insert(
                    cabinet_id.clone(),
                    ShardTransportError::Request("cabinet has no endpoint".to_string()),
                );
                continue;
            };
            match serde_json::to_vec(&payload) {
                Ok(body) => calls.push((
                    cabinet_id.clone(),
                    AgentRequest {
                        method: AgentMethod::Post,
                        endpoint: endpoint.clone(),
                        path: INSERT_TBOARD_PATH.to_string(),
                        body: Some(body),
                    },
                )),
                Err(err) => {
                    failures.insert(
                        cabinet_id.clone(),
                        ShardTransportError::Request(format!("encode payload: {err}")),
                    );
                }
            }
        }

        let timeout = self.config.agent_timeout;
        let mut results = fanout::per_cabinet(self.config.dispatch_concurrency, calls, |c, r| {
            let agents = self.agents.clone();
            async move { agents.call(&c, r, timeout).await }
        })
        .await;

        let mut accepted = ShardPlan::new();
        for (cabinet_id, devices) in &shards {
            if failures.contains_key(cabinet_id) {
                continue;
            }
            match results.remove(cabinet_id) {
                Some(Ok(_)) => {
                    accepted.insert(cabinet_id.clone(), devices.clone());
                }
                Some(Err(err)) => {
                    failures.insert(cabinet_id.clone(), err);
                }
                None => {
                    failures.insert(
                        cabinet_id.clone(),
                        ShardTransportError::Request("shard task aborted".to_string()),
                    );
                }
            }
        }

        if accepted.is_empty() {
            self.store.detach_devices(run.id, &run.devices)?;
            self.store.delete_run(run.id)?;
            self.metrics.dispatch_rejected_total.inc();
            tracing::warn!(
                target: "tboard_proof",
                event = "dispatch_rejected",
                run_id = %run.id,
                failed = failures.len(),
                "every shard failed; run rolled back"
            );
            return Err(DispatchError::AllShardsFailed { failures });
        }

        for cabinet_id in failures.keys() {
            if let Some(devices) = shards.get(cabinet_id) {
                self.store.detach_devices(run.id, devices)?;
            }
            self.store.compare_and_set_shard_status(
                run.id,
                cabinet_id,
                ShardState::Running,
                ShardState::Failed,
            )?;
        }

        let confirmed: BTreeSet<DeviceId> = accepted.values().flatten().cloned().collect();
        self.store.claim_devices(run.id, &confirmed)?;
        self.settle_early_completions(run.id, &accepted)?;

        let handle = RunHandle {
            run_id: run.id,
            shards: accepted,
        };
        if failures.is_empty() {
            self.metrics.dispatch_accepted_total.inc();
            tracing::info!(
                target: "tboard_proof",
                event = "dispatch_accepted",
                run_id = %run.id,
                devices = confirmed.len(),
                "all shards accepted"
            );
            Ok(DispatchOutcome::Accepted(handle))
        } else {
            self.metrics.dispatch_partial_total.inc();
            for (cabinet_id, err) in &failures {
                tracing::warn!(
                    target: "tboard_proof",
                    event = "shard_failed",
                    run_id = %run.id,
                    cabinet_id = %cabinet_id,
                    error = %err,
                    "shard dispatch failed"
                );
            }
            Ok(DispatchOutcome::Partial {
                run: handle,
                failed: failures,
            })
        }
    }

    /// An agent may report completion between its 200 and the claim above.
    /// Such shards were never released, and the run may have missed its
    /// finalization while failed shards were still `Running`.
    fn settle_early_completions(
        &self,
        run_id: RunId,
        accepted: &ShardPlan,
    ) -> Result<(), StoreError> {
        let run = self.store.get_run(run_id)?;
        let mut settled = false;
        for (cabinet_id, devices) in accepted {
            let terminal = run
                .shard_status
                .get(cabinet_id)
                .is_some_and(|s| s.is_terminal());
            if terminal {
                tracing::debug!(
                    run_id = %run_id,
                    cabinet_id = %cabinet_id,
                    "shard completed before its devices were claimed"
                );
                self.release_shard(run_id, cabinet_id, Some(devices))?;
                settled = true;
            }
        }
        if settled && !run.finished {
            self.finalize(run_id, unix_time_ms())?;
        }
        Ok(())
    }

    fn validate(&self, req: &DispatchRequest) -> Result<Validated, DispatchError> {
        if req.devices.is_empty() {
            return Err(ValidationError::EmptyDevices.into());
        }
        if req.jobs.is_empty() {
            return Err(ValidationError::EmptyJobs.into());
        }
        if req.repeat_count == 0 {
            return Err(ValidationError::ZeroRepeat.into());
        }

        let mut devices = Vec::with_capacity(req.devices.len());
        let mut unknown_devices = Vec::new();
        for id in &req.devices {
            match self.directory.device(id) {
                Ok(d) => devices.push(d),
                Err(StoreError::DeviceNotFound(_)) => unknown_devices.push(id.clone()),
                Err(err) => return Err(err.into()),
            }
        }
        if !unknown_devices.is_empty() {
            return Err(ValidationError::UnknownDevices(unknown_devices).into());
        }

        let mut jobs = Vec::with_capacity(req.jobs.len());
        let mut unknown_jobs = Vec::new();
        for id in &req.jobs {
            match self.directory.job(id) {
                Ok(j) => jobs.push(j),
                Err(StoreError::JobNotFound(_)) => unknown_jobs.push(id.clone()),
                Err(err) => return Err(err.into()),
            }
        }
        if !unknown_jobs.is_empty() {
            return Err(ValidationError::UnknownJobs(unknown_jobs).into());
        }

        let incomplete: Vec<JobId> = jobs
            .iter()
            .filter(|j| !j.artifact_complete)
            .map(|j| j.id.clone())
            .collect();
        if !incomplete.is_empty() {
            return Err(ValidationError::IncompleteJobs(incomplete).into());
        }

        let unavailable: Vec<DeviceId> = devices
            .iter()
            .filter(|d| !d.status.accepts_dispatch())
            .map(|d| d.id.clone())
            .collect();
        if !unavailable.is_empty() {
            return Err(ValidationError::UnavailableDevices(unavailable).into());
        }

        let mut incompatible = Vec::new();
        for job in &jobs {
            for device in &devices {
                if !job.supports(device) {
                    incompatible.push((job.id.clone(), device.id.clone()));
                }
            }
        }
        if !incompatible.is_empty() {
            return Err(ValidationError::Incompatible(incompatible).into());
        }

        let mut endpoints = BTreeMap::new();
        let mut unknown_cabinets = Vec::new();
        let cabinet_ids: BTreeSet<&CabinetId> = devices.iter().map(|d| &d.cabinet).collect();
        for id in cabinet_ids {
            match self.directory.cabinet(id) {
                Ok(c) => {
                    endpoints.insert(c.id, c.endpoint);
                }
                Err(StoreError::CabinetNotFound(_)) => unknown_cabinets.push(id.clone()),
                Err(err) => return Err(err.into()),
            }
        }
        if !unknown_cabinets.is_empty() {
            return Err(ValidationError::UnknownCabinets(unknown_cabinets).into());
        }

        Ok(Validated {
            devices,
            jobs,
            endpoints,
        })
    }
}

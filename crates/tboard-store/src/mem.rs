use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use tboard_core::types::{
    Cabinet, CabinetId, CounterDelta, Device, DeviceId, DeviceStatus, JobId, JobSpec, NewResult,
    NewRun, ResultCounters, ResultId, ResultRecord, RunId, ShardState, TestRun,
};

use crate::{DeviceDirectory, RunStore, StoreError};

#[derive(Debug, Default)]
struct State {
    runs: BTreeMap<RunId, TestRun>,
    results: BTreeMap<ResultId, ResultRecord>,
    devices: BTreeMap<DeviceId, Device>,
    cabinets: BTreeMap<CabinetId, Cabinet>,
    jobs: BTreeMap<JobId, JobSpec>,
    next_run_id: u64,
    next_result_id: u64,
}

impl State {
    fn run_mut(&mut self, id: RunId) -> Result<&mut TestRun, StoreError> {
        self.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))
    }
}

/// In-process `RunStore` and `DeviceDirectory` behind one mutex.
#[derive(Debug, Default)]
pub struct MemRunStore {
    state: Mutex<State>,
}

impl MemRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn upsert_cabinet(&self, cabinet: Cabinet) -> Result<(), StoreError> {
        self.lock()?.cabinets.insert(cabinet.id.clone(), cabinet);
        Ok(())
    }

    pub fn upsert_device(&self, device: Device) -> Result<(), StoreError> {
        self.lock()?.devices.insert(device.id.clone(), device);
        Ok(())
    }

    pub fn upsert_job(&self, job: JobSpec) -> Result<(), StoreError> {
        self.lock()?.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    pub fn run_count(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.runs.len())
    }
}

impl DeviceDirectory for MemRunStore {
    fn device(&self, id: &DeviceId) -> Result<Device, StoreError> {
        self.lock()?
            .devices
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::DeviceNotFound(id.clone()))
    }

    fn cabinet(&self, id: &CabinetId) -> Result<Cabinet, StoreError> {
        self.lock()?
            .cabinets
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::CabinetNotFound(id.clone()))
    }

    fn job(&self, id: &JobId) -> Result<JobSpec, StoreError> {
        self.lock()?
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::JobNotFound(id.clone()))
    }
}

impl RunStore for MemRunStore {
    fn create_run(&self, new: NewRun) -> Result<TestRun, StoreError> {
        let mut state = self.lock()?;
        state.next_run_id = state.next_run_id.wrapping_add(1);
        let id = RunId(state.next_run_id);

        let devices = new.shards.values().flatten().cloned().collect();
        let shard_status = new
            .shards
            .keys()
            .map(|c| (c.clone(), ShardState::Running))
            .collect();

        let run = TestRun {
            id,
            name: new.metadata.name,
            owner: new.metadata.owner,
            description: new.metadata.description,
            created_at_ms: new.created_at_ms,
            finished: false,
            end_time_ms: None,
            devices,
            jobs: new.jobs,
            repeat_count: new.repeat_count,
            shard_status,
            counters: ResultCounters::default(),
            success_ratio: None,
            marked_for_deletion: false,
            agent_snapshots: BTreeMap::new(),
        };
        state.runs.insert(id, run.clone());
        Ok(run)
    }

    fn get_run(&self, id: RunId) -> Result<TestRun, StoreError> {
        self.lock()?
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::RunNotFound(id))
    }

    fn delete_run(&self, id: RunId) -> Result<(), StoreError> {
        self.lock()?
            .runs
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::RunNotFound(id))
    }

    fn detach_devices(&self, id: RunId, devices: &BTreeSet<DeviceId>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let run = state.run_mut(id)?;
        run.devices.retain(|d| !devices.contains(d));
        Ok(())
    }

    fn compare_and_set_shard_status(
        &self,
        id: RunId,
        cabinet: &CabinetId,
        expected: ShardState,
        new: ShardState,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let run = state.run_mut(id)?;
        match run.shard_status.get_mut(cabinet) {
            Some(current) if *current == expected => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn finalize_if_all_done(&self, id: RunId, end_time_ms: u64) -> Result<bool, StoreError> {
        let mut state = self.lock()?;
        let run = state.run_mut(id)?;
        if run.finished || !run.all_shards_terminal() {
            return Ok(false);
        }
        run.finished = true;
        run.end_time_ms = Some(end_time_ms);
        Ok(true)
    }

    fn set_marked_for_deletion(&self, id: RunId, marked: bool) -> Result<(), StoreError> {
        self.lock()?.run_mut(id)?.marked_for_deletion = marked;
        Ok(())
    }

    fn record_agent_snapshot(
        &self,
        id: RunId,
        cabinet: &CabinetId,
        snapshot: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.lock()?
            .run_mut(id)?
            .agent_snapshots
            .insert(cabinet.clone(), snapshot);
        Ok(())
    }

    fn apply_result_delta(
        &self,
        id: RunId,
        delta: CounterDelta,
    ) -> Result<Option<f64>, StoreError> {
        let mut state = self.lock()?;
        let run = state.run_mut(id)?;
        run.counters.apply(delta);
        run.success_ratio = run.counters.ratio();
        Ok(run.success_ratio)
    }

    fn claim_devices(&self, id: RunId, devices: &BTreeSet<DeviceId>) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        if let Some(missing) = devices.iter().find(|d| !state.devices.contains_key(*d)) {
            return Err(StoreError::DeviceNotFound(missing.clone()));
        }
        for device_id in devices {
            if let Some(device) = state.devices.get_mut(device_id) {
                device.status = DeviceStatus::Busy;
                device.latest_run = Some(id);
            }
        }
        Ok(())
    }

    fn release_devices_if_owned(
        &self,
        id: RunId,
        devices: &BTreeSet<DeviceId>,
    ) -> Result<Vec<DeviceId>, StoreError> {
        let mut state = self.lock()?;
        let mut released = Vec::new();
        for device_id in devices {
            let Some(device) = state.devices.get_mut(device_id) else {
                continue;
            };
            if device.latest_run != Some(id) {
                tracing::debug!(
                    run_id = %id,
                    device_id = %device_id,
                    latest_run = ?device.latest_run,
                    "stale device claim; release skipped"
                );
                continue;
            }
            if device.status == DeviceStatus::Busy {
                device.status = DeviceStatus::Idle;
                released.push(device_id.clone());
            }
        }
        Ok(released)
    }

    fn insert_result(&self, new: NewResult) -> Result<ResultRecord, StoreError> {
        let mut state = self.lock()?;
        if !state.runs.contains_key(&new.run_id) {
            return Err(StoreError::RunNotFound(new.run_id));
        }
        state.next_result_id = state.next_result_id.wrapping_add(1);
        let record = ResultRecord {
            id: ResultId(state.next_result_id),
            run_id: new.run_id,
            device: new.device,
            job: new.job,
            start_time_ms: new.start_time_ms,
            end_time_ms: new.end_time_ms,
            assessment: new.assessment,
        };
        state.results.insert(record.id, record.clone());
        Ok(record)
    }

    fn get_result(&self, id: ResultId) -> Result<ResultRecord, StoreError> {
        self.lock()?
            .results
            .get(&id)
            .cloned()
            .ok_or(StoreError::ResultNotFound(id))
    }

    fn update_result(&self, record: ResultRecord) -> Result<ResultRecord, StoreError> {
        let mut state = self.lock()?;
        if !state.runs.contains_key(&record.run_id) {
            return Err(StoreError::RunNotFound(record.run_id));
        }
        let Some(slot) = state.results.get_mut(&record.id) else {
            return Err(StoreError::ResultNotFound(record.id));
        };
        if !slot.accepts_update(&record) {
            return Err(StoreError::ResultImmutable(record.id));
        }
        Ok(std::mem::replace(slot, record))
    }

    fn remove_result(&self, id: ResultId) -> Result<ResultRecord, StoreError> {
        self.lock()?
            .results
            .remove(&id)
            .ok_or(StoreError::ResultNotFound(id))
    }

    fn results_for_run(&self, id: RunId) -> Result<Vec<ResultRecord>, StoreError> {
        Ok(self
            .lock()?
            .results
            .values()
            .filter(|r| r.run_id == id)
            .cloned()
            .collect())
    }

    fn delete_results_for_run(&self, id: RunId) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let before = state.results.len();
        state.results.retain(|_, r| r.run_id != id);
        Ok(before - state.results.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    use tboard_core::types::{Assessment, RunMetadata, ShardPlan};

    fn cab(id: &str) -> CabinetId {
        CabinetId(id.to_string())
    }

    fn dev(id: &str) -> DeviceId {
        DeviceId(id.to_string())
    }

    fn seeded() -> anyhow::Result<MemRunStore> {
        let store = MemRunStore::new();
        for (d, c) in [("d1", "A"), ("d2", "A"), ("d3", "B")] {
            store.upsert_device(Device {
                id: dev(d),
                cabinet: cab(c),
                phone_model: "p1".to_string(),
                status: DeviceStatus::Idle,
                latest_run: None,
            })?;
        }
        Ok(store)
    }

    fn new_run(shards: &[(&str, &[&str])]) -> NewRun {
        let shards: ShardPlan = shards
            .iter()
            .map(|(c, ds)| (cab(c), ds.iter().map(|d| dev(d)).collect()))
            .collect();
        NewRun {
            metadata: RunMetadata {
                name: "run".to_string(),
                owner: "qa".to_string(),
                description: String::new(),
            },
            jobs: vec![JobId("j1".to_string())],
            repeat_count: 1,
            shards,
            created_at_ms: 1,
        }
    }

    #[test]
    fn create_run_starts_every_shard_running() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1", "d2"]), ("B", &["d3"])]))?;
        assert_eq!(run.shard_status.len(), 2);
        assert!(run
            .shard_status
            .values()
            .all(|s| *s == ShardState::Running));
        assert_eq!(run.devices.len(), 3);
        assert!(!run.finished);
        assert_eq!(store.device(&dev("d1"))?.status, DeviceStatus::Idle);
        Ok(())
    }

    #[test]
    fn cas_only_applies_on_expected_state() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1"])]))?;
        assert!(!store.compare_and_set_shard_status(
            run.id,
            &cab("A"),
            ShardState::Done,
            ShardState::Failed
        )?);
        assert!(store.compare_and_set_shard_status(
            run.id,
            &cab("A"),
            ShardState::Running,
            ShardState::Done
        )?);
        assert!(!store.compare_and_set_shard_status(
            run.id,
            &cab("A"),
            ShardState::Running,
            ShardState::Failed
        )?);
        assert!(!store.compare_and_set_shard_status(
            run.id,
            &cab("Z"),
            ShardState::Running,
            ShardState::Done
        )?);
        Ok(())
    }

    #[test]
    fn finalize_waits_for_every_shard_and_fires_once() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1"]), ("B", &["d3"])]))?;

        store.compare_and_set_shard_status(run.id, &cab("A"), ShardState::Running, ShardState::Done)?;
        assert!(!store.finalize_if_all_done(run.id, 10)?);

        store.compare_and_set_shard_status(
            run.id,
            &cab("B"),
            ShardState::Running,
            ShardState::Failed,
        )?;
        assert!(store.finalize_if_all_done(run.id, 20)?);
        assert!(!store.finalize_if_all_done(run.id, 30)?);

        let run = store.get_run(run.id)?;
        assert!(run.finished);
        assert_eq!(run.end_time_ms, Some(20));
        Ok(())
    }

    #[test]
    fn concurrent_finalize_has_single_winner() -> anyhow::Result<()> {
        let store = Arc::new(seeded()?);
        let run = store.create_run(new_run(&[("A", &["d1"])]))?;
        store.compare_and_set_shard_status(run.id, &cab("A"), ShardState::Running, ShardState::Done)?;

        let threads = 12;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for i in 0..threads {
            let store = store.clone();
            let barrier = barrier.clone();
            let winners = winners.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                if store
                    .finalize_if_all_done(run.id, i as u64)
                    .expect("finalize should not error")
                {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().expect("thread join");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn release_skips_devices_claimed_by_newer_run() -> anyhow::Result<()> {
        let store = seeded()?;
        let r1 = store.create_run(new_run(&[("A", &["d1", "d2"])]))?;
        let both: BTreeSet<DeviceId> = [dev("d1"), dev("d2")].into_iter().collect();
        store.claim_devices(r1.id, &both)?;

        let r2 = store.create_run(new_run(&[("A", &["d1"])]))?;
        store.claim_devices(r2.id, &[dev("d1")].into_iter().collect())?;

        let released = store.release_devices_if_owned(r1.id, &both)?;
        assert_eq!(released, vec![dev("d2")]);
        let d1 = store.device(&dev("d1"))?;
        assert_eq!(d1.status, DeviceStatus::Busy);
        assert_eq!(d1.latest_run, Some(r2.id));
        assert_eq!(store.device(&dev("d2"))?.status, DeviceStatus::Idle);
        Ok(())
    }

    #[test]
    fn claim_rejects_unknown_device_without_partial_mutation() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1"])]))?;
        let devices: BTreeSet<DeviceId> = [dev("d1"), dev("ghost")].into_iter().collect();
        let err = store.claim_devices(run.id, &devices).unwrap_err();
        assert_eq!(err, StoreError::DeviceNotFound(dev("ghost")));
        assert_eq!(store.device(&dev("d1"))?.status, DeviceStatus::Idle);
        Ok(())
    }

    #[test]
    fn result_delta_recomputes_ratio() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1"])]))?;
        assert_eq!(
            store.apply_result_delta(run.id, CounterDelta { total: 1, success: 0 })?,
            Some(0.0)
        );
        assert_eq!(
            store.apply_result_delta(run.id, CounterDelta { total: 1, success: 1 })?,
            Some(0.5)
        );
        assert_eq!(
            store.apply_result_delta(run.id, CounterDelta { total: -2, success: -1 })?,
            None
        );
        Ok(())
    }

    #[test]
    fn results_follow_their_run() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1"])]))?;
        let rec = store.insert_result(NewResult {
            run_id: run.id,
            device: dev("d1"),
            job: JobId("j1".to_string()),
            start_time_ms: 1,
            end_time_ms: Some(2),
            assessment: Some(Assessment::Success),
        })?;
        assert_eq!(store.results_for_run(run.id)?, vec![rec.clone()]);

        let err = store
            .insert_result(NewResult {
                run_id: RunId(999),
                device: dev("d1"),
                job: JobId("j1".to_string()),
                start_time_ms: 1,
                end_time_ms: None,
                assessment: None,
            })
            .unwrap_err();
        assert_eq!(err, StoreError::RunNotFound(RunId(999)));

        assert_eq!(store.delete_results_for_run(run.id)?, 1);
        assert!(store.results_for_run(run.id)?.is_empty());
        Ok(())
    }

    #[test]
    fn ended_result_rejects_identity_changes() -> anyhow::Result<()> {
        let store = seeded()?;
        let run = store.create_run(new_run(&[("A", &["d1"])]))?;
        let other = store.create_run(new_run(&[("A", &["d1"])]))?;
        let pending = store.insert_result(NewResult {
            run_id: run.id,
            device: dev("d1"),
            job: JobId("j1".to_string()),
            start_time_ms: 1,
            end_time_ms: None,
            assessment: None,
        })?;

        let mut ended = pending.clone();
        ended.end_time_ms = Some(5);
        ended.assessment = Some(Assessment::Fail);
        store.update_result(ended.clone())?;

        // A writer still holding the pending copy cannot rewrite the row.
        let mut stale = pending.clone();
        stale.device = dev("d2");
        assert_eq!(
            store.update_result(stale).unwrap_err(),
            StoreError::ResultImmutable(pending.id)
        );
        assert_eq!(store.get_result(pending.id)?, ended);

        let mut moved = ended.clone();
        moved.run_id = other.id;
        moved.assessment = Some(Assessment::Success);
        assert_eq!(store.update_result(moved.clone())?, ended);
        assert_eq!(store.get_result(pending.id)?, moved);
        Ok(())
    }
}

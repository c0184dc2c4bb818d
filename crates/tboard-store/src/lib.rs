#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod kv;
pub mod mem;

use std::collections::BTreeSet;

use tboard_core::types::{
    Cabinet, CabinetId, CounterDelta, Device, DeviceId, JobId, JobSpec, NewResult, NewRun,
    ResultId, ResultRecord, RunId, ShardState, TestRun,
};
use thiserror::Error;

pub use kv::{LedgerError, LedgerKv, MemLedgerKv};
pub use mem::MemRunStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),
    #[error("result not found: {0}")]
    ResultNotFound(ResultId),
    #[error("result {0} has ended; only its run and assessment may change")]
    ResultImmutable(ResultId),
    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),
    #[error("cabinet not found: {0}")]
    CabinetNotFound(CabinetId),
    #[error("job not found: {0}")]
    JobNotFound(JobId),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Read side of the device/cabinet/job catalog.
pub trait DeviceDirectory: Send + Sync + 'static {
    fn device(&self, id: &DeviceId) -> Result<Device, StoreError>;
    fn cabinet(&self, id: &CabinetId) -> Result<Cabinet, StoreError>;
    fn job(&self, id: &JobId) -> Result<JobSpec, StoreError>;
}

/// Authoritative state of runs, their result rows, and device claims.
///
/// Every method is atomic with respect to every other method; callers never
/// read-modify-write run state outside the store.
pub trait RunStore: Send + Sync + 'static {
    /// Persists a run with every shard `Running` and all shard devices attached.
    fn create_run(&self, new: NewRun) -> Result<TestRun, StoreError>;
    fn get_run(&self, id: RunId) -> Result<TestRun, StoreError>;
    fn delete_run(&self, id: RunId) -> Result<(), StoreError>;
    /// Removes device associations from the run. Device status is untouched.
    fn detach_devices(&self, id: RunId, devices: &BTreeSet<DeviceId>) -> Result<(), StoreError>;

    /// Sets `shard_status[cabinet] = new` iff it currently equals `expected`.
    fn compare_and_set_shard_status(
        &self,
        id: RunId,
        cabinet: &CabinetId,
        expected: ShardState,
        new: ShardState,
    ) -> Result<bool, StoreError>;

    /// Flips `finished` once, and only when every shard is terminal.
    fn finalize_if_all_done(&self, id: RunId, end_time_ms: u64) -> Result<bool, StoreError>;

    fn set_marked_for_deletion(&self, id: RunId, marked: bool) -> Result<(), StoreError>;
    fn record_agent_snapshot(
        &self,
        id: RunId,
        cabinet: &CabinetId,
        snapshot: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Applies `delta` to the run counters and returns the recomputed ratio.
    fn apply_result_delta(&self, id: RunId, delta: CounterDelta)
        -> Result<Option<f64>, StoreError>;

    /// Marks devices `Busy` with `latest_run = id`.
    fn claim_devices(&self, id: RunId, devices: &BTreeSet<DeviceId>) -> Result<(), StoreError>;

    /// Returns `Busy` devices to `Idle` when their most recent run is still
    /// `id`; returns the devices actually released.
    fn release_devices_if_owned(
        &self,
        id: RunId,
        devices: &BTreeSet<DeviceId>,
    ) -> Result<Vec<DeviceId>, StoreError>;

    fn insert_result(&self, new: NewResult) -> Result<ResultRecord, StoreError>;
    fn get_result(&self, id: ResultId) -> Result<ResultRecord, StoreError>;
    /// Replaces the stored row; returns the previous version. Fails with
    /// `ResultImmutable` when the stored row rejects `record` under
    /// [`ResultRecord::accepts_update`].
    fn update_result(&self, record: ResultRecord) -> Result<ResultRecord, StoreError>;
    fn remove_result(&self, id: ResultId) -> Result<ResultRecord, StoreError>;
    fn results_for_run(&self, id: RunId) -> Result<Vec<ResultRecord>, StoreError>;
    fn delete_results_for_run(&self, id: RunId) -> Result<usize, StoreError>;
}

use std::collections::BTreeMap;
use std::fmt::Display;

use tboard_core::types::{CabinetId, DeviceId, JobId, ResultId, RunId};
use tboard_store::{LedgerError, StoreError};
use tboard_wire::ConvertError;
use thiserror::Error;

use crate::agent::ShardTransportError;

fn list<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn pairs(items: &[(JobId, DeviceId)]) -> String {
    items
        .iter()
        .map(|(j, d)| format!("{j}@{d}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn shard_failures(items: &BTreeMap<CabinetId, ShardTransportError>) -> String {
    items
        .iter()
        .map(|(c, e)| format!("{c}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bad dispatch input. Nothing is persisted when this is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("devices must be non-empty")]
    EmptyDevices,
    #[error("jobs must be non-empty")]
    EmptyJobs,
    #[error("repeat_count must be >= 1")]
    ZeroRepeat,
    #[error("unknown devices: {}", list(.0))]
    UnknownDevices(Vec<DeviceId>),
    #[error("unknown jobs: {}", list(.0))]
    UnknownJobs(Vec<JobId>),
    #[error("unknown cabinets: {}", list(.0))]
    UnknownCabinets(Vec<CabinetId>),
    #[error("jobs with incomplete artifacts: {}", list(.0))]
    IncompleteJobs(Vec<JobId>),
    #[error("devices unavailable for dispatch: {}", list(.0))]
    UnavailableDevices(Vec<DeviceId>),
    #[error("job/device pairs not compatible: {}", pairs(.0))]
    Incompatible(Vec<(JobId, DeviceId)>),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("dispatch rejected, every shard failed: {}", shard_failures(.failures))]
    AllShardsFailed {
        failures: BTreeMap<CabinetId, ShardTransportError>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CancelError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IngestError {
    #[error("result {0} has ended; only its run and assessment may change")]
    Immutable(ResultId),
    #[error(transparent)]
    Convert(#[from] ConvertError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DeletionError {
    #[error("deletion of run {run_id} gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        run_id: RunId,
        attempts: u32,
        last_error: String,
    },
    #[error("deletion worker is not running")]
    WorkerStopped,
    #[error("artifact cleanup failed: {0}")]
    Artifacts(#[from] std::io::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CabinetId(pub String);

/// Device label, unique across the farm.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

/// Job label, unique across the catalog.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ResultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CabinetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("unknown shard status code {0}")]
pub struct UnknownShardCode(pub i8);

/// Dispatch/run state of one cabinet's shard of a run.
///
/// Agents speak in integer codes (`1` running, `0` done, `-1` failed); those
/// codes are what gets serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum ShardState {
    Running,
    Done,
    Failed,
}

impl ShardState {
    pub const fn code(self) -> i8 {
        match self {
            ShardState::Running => 1,
            ShardState::Done => 0,
            ShardState::Failed => -1,
        }
    }

    pub fn from_code(code: i8) -> Result<Self, UnknownShardCode> {
        match code {
            1 => Ok(ShardState::Running),
            0 => Ok(ShardState::Done),
            -1 => Ok(ShardState::Failed),
            other => Err(UnknownShardCode(other)),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, ShardState::Running)
    }
}

impl From<ShardState> for i8 {
    fn from(state: ShardState) -> Self {
        state.code()
    }
}

impl TryFrom<i8> for ShardState {
    type Error = UnknownShardCode;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

pub type ShardStatusMap = BTreeMap<CabinetId, ShardState>;

/// Devices of a run grouped by the cabinet that owns them.
pub type ShardPlan = BTreeMap<CabinetId, BTreeSet<DeviceId>>;

/// Signed change to a run's result counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub total: i64,
    pub success: i64,
}

impl CounterDelta {
    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.success == 0
    }

    pub fn negate(self) -> Self {
        Self {
            total: -self.total,
            success: -self.success,
        }
    }
}

/// Running counts behind `TestRun::success_ratio`. Only terminal results count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultCounters {
    pub total: u64,
    pub success: u64,
}

impl ResultCounters {
    pub fn apply(&mut self, delta: CounterDelta) {
        self.total = self.total.saturating_add_signed(delta.total);
        self.success = self.success.saturating_add_signed(delta.success);
        // A stale delete can never push success above total.
        self.success = self.success.min(self.total);
    }

    pub fn ratio(&self) -> Option<f64> {
        if self.total == 0 {
            None
        } else {
            Some(self.success as f64 / self.total as f64)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub name: String,
    pub owner: String,
    pub description: String,
}

/// One logical request to execute `jobs` on `devices`, `repeat_count` times.
///
/// Invariant: once `finished` is set, no entry of `shard_status` is `Running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRun {
    pub id: RunId,
    pub name: String,
    pub owner: String,
    pub description: String,
    /// Creation timestamp in Unix milliseconds.
    pub created_at_ms: u64,
    pub finished: bool,
    pub end_time_ms: Option<u64>,
    pub devices: BTreeSet<DeviceId>,
    pub jobs: Vec<JobId>,
    pub repeat_count: u32,
    pub shard_status: ShardStatusMap,
    pub counters: ResultCounters,
    pub success_ratio: Option<f64>,
    pub marked_for_deletion: bool,
    /// Final parameter snapshot returned by a cabinet's stop call.
    pub agent_snapshots: BTreeMap<CabinetId, serde_json::Value>,
}

impl TestRun {
    pub fn all_shards_terminal(&self) -> bool {
        self.shard_status.values().all(|s| s.is_terminal())
    }

    pub fn running_cabinets(&self) -> Vec<CabinetId> {
        self.shard_status
            .iter()
            .filter(|(_, s)| **s == ShardState::Running)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

/// Input to `RunStore::create_run`. Every shard key starts out `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRun {
    pub metadata: RunMetadata,
    pub jobs: Vec<JobId>,
    pub repeat_count: u32,
    pub shards: ShardPlan,
    pub created_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    Success,
    Fail,
    Invalid,
}

/// Classification of a result record for aggregate purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Still running, or ended without a success/fail verdict.
    Pending,
    Success,
    Fail,
}

impl Outcome {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Outcome::Pending)
    }

    /// Contribution of one record with this outcome to the run counters.
    pub fn weight(self) -> CounterDelta {
        match self {
            Outcome::Pending => CounterDelta::default(),
            Outcome::Success => CounterDelta {
                total: 1,
                success: 1,
            },
            Outcome::Fail => CounterDelta {
                total: 1,
                success: 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub id: ResultId,
    pub run_id: RunId,
    pub device: DeviceId,
    pub job: JobId,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub assessment: Option<Assessment>,
}

impl ResultRecord {
    pub fn outcome(&self) -> Outcome {
        if self.end_time_ms.is_none() {
            return Outcome::Pending;
        }
        match self.assessment {
            Some(Assessment::Success) => Outcome::Success,
            Some(Assessment::Fail) => Outcome::Fail,
            Some(Assessment::Invalid) | None => Outcome::Pending,
        }
    }

    /// Whether `next` may replace this row. Once a row has an end time only
    /// its run and assessment may change.
    pub fn accepts_update(&self, next: &ResultRecord) -> bool {
        self.end_time_ms.is_none()
            || (self.device == next.device
                && self.job == next.job
                && self.start_time_ms == next.start_time_ms
                && self.end_time_ms == next.end_time_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewResult {
    pub run_id: RunId,
    pub device: DeviceId,
    pub job: JobId,
    pub start_time_ms: u64,
    pub end_time_ms: Option<u64>,
    pub assessment: Option<Assessment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Idle,
    Busy,
    Error,
    Offline,
}

impl DeviceStatus {
    /// Whether a run may be dispatched onto a device in this status.
    pub fn accepts_dispatch(self) -> bool {
        matches!(self, DeviceStatus::Idle | DeviceStatus::Busy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub cabinet: CabinetId,
    #[serde(default)]
    pub phone_model: String,
    pub status: DeviceStatus,
    /// The run that most recently claimed this device.
    #[serde(default)]
    pub latest_run: Option<RunId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cabinet {
    pub id: CabinetId,
    /// Agent base URL, e.g. `http://10.0.3.17:5000`.
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub name: String,
    #[serde(default)]
    pub flow_type: String,
    #[serde(default)]
    pub inner_jobs: Vec<JobId>,
    /// False while the job's script/resource bundle is still being uploaded.
    pub artifact_complete: bool,
    /// Phone models the job can run on; empty means any.
    #[serde(default)]
    pub phone_models: BTreeSet<String>,
}

impl JobSpec {
    pub fn supports(&self, device: &Device) -> bool {
        self.phone_models.is_empty() || self.phone_models.contains(&device.phone_model)
    }
}

/// A cabinet's end-of-run report, possibly covering several cabinets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardCompletion {
    pub run_id: RunId,
    pub end_time_ms: Option<u64>,
    /// Only terminal states.
    pub updates: BTreeMap<CabinetId, ShardState>,
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{RunId, TestRun};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeletionState {
    ToDelete,
    Deleting,
    Deleted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown deletion state {0:?}")]
pub struct UnknownDeletionState(pub String);

impl DeletionState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionState::ToDelete => "TO_DELETE",
            DeletionState::Deleting => "DELETING",
            DeletionState::Deleted => "DELETED",
        }
    }

    /// Secondary sort key of the ledger snapshot: in-flight work first.
    pub fn priority(self) -> u8 {
        match self {
            DeletionState::Deleting => 0,
            DeletionState::ToDelete => 1,
            DeletionState::Deleted => 2,
        }
    }
}

impl fmt::Display for DeletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeletionState {
    type Err = UnknownDeletionState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TO_DELETE" => Ok(DeletionState::ToDelete),
            "DELETING" => Ok(DeletionState::Deleting),
            "DELETED" => Ok(DeletionState::Deleted),
            other => Err(UnknownDeletionState(other.to_string())),
        }
    }
}

/// Progress record of one asynchronous run deletion.
///
/// Tickets copy what they need from the run so they stay readable after the
/// run row is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletionTicket {
    pub run_id: RunId,
    pub name: String,
    pub created_at_ms: u64,
    pub success_ratio: Option<f64>,
    pub owner: String,
    pub state: DeletionState,
    pub record_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedDeletionTicket {
    pub run_id: RunId,
    pub name: String,
    pub created_at_ms: u64,
    pub success_ratio: Option<f64>,
    pub owner: String,
    pub record_time_ms: u64,
}

impl DeletionTicket {
    pub fn for_run(run: &TestRun, record_time_ms: u64) -> Self {
        Self {
            run_id: run.id,
            name: run.name.clone(),
            created_at_ms: run.created_at_ms,
            success_ratio: run.success_ratio,
            owner: run.owner.clone(),
            state: DeletionState::ToDelete,
            record_time_ms,
        }
    }

    pub fn with_state(mut self, state: DeletionState, record_time_ms: u64) -> Self {
        self.state = state;
        self.record_time_ms = record_time_ms;
        self
    }

    pub fn into_failed(self, record_time_ms: u64) -> FailedDeletionTicket {
        FailedDeletionTicket {
            run_id: self.run_id,
            name: self.name,
            created_at_ms: self.created_at_ms,
            success_ratio: self.success_ratio,
            owner: self.owner,
            record_time_ms,
        }
    }
}

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tboard_core::types::{
    CabinetId, DeviceId, JobSpec, RunId, ShardCompletion, ShardState, TestRun,
};
use thiserror::Error;

pub const INSERT_TBOARD_PATH: &str = "/tboard/insert_tboard/";

pub fn remove_tboard_path(run_id: RunId) -> String {
    format!("/tboard/remove_tboard/{run_id}/")
}

pub fn end_tboard_path(run_id: RunId) -> String {
    format!("/end_tboard/{run_id}/")
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{field} must be non-empty")]
    EmptyField { field: &'static str },
    #[error("shard_status_delta must name at least one cabinet")]
    EmptyDelta,
    #[error("cabinet {cabinet}: unknown shard status code {code}")]
    UnknownShardCode { cabinet: String, code: i8 },
    #[error("cabinet {cabinet}: completion must carry a terminal status")]
    NonTerminalState { cabinet: String },
}

pub trait ToWire<T> {
    fn to_wire(&self) -> T;
}

pub trait TryToCore<T> {
    type Error;
    fn try_to_core(&self) -> Result<T, Self::Error>;
}

/// One job of the bundle sent to a cabinet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_label: String,
    pub job_name: String,
    pub flow_type: String,
    pub inner_job_list: Vec<String>,
}

/// Body of `POST /tboard/insert_tboard/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertTboardRequest {
    pub tboard_id: u64,
    pub board_name: String,
    pub owner_name: String,
    pub jobs: Vec<JobPayload>,
    pub device_label_list: Vec<String>,
    pub repeat_time: u32,
    pub create_time: u64,
}

/// Body of the agent's `PUT /end_tboard/{run_id}/` callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndTboardRequest {
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub shard_status_delta: BTreeMap<String, i8>,
}

impl ToWire<JobPayload> for JobSpec {
    fn to_wire(&self) -> JobPayload {
        JobPayload {
            job_label: self.id.0.clone(),
            job_name: self.name.clone(),
            flow_type: self.flow_type.clone(),
            inner_job_list: self.inner_jobs.iter().map(|j| j.0.clone()).collect(),
        }
    }
}

/// Everything one cabinet needs to start its shard of a run.
#[derive(Debug, Clone, Copy)]
pub struct ShardPayload<'a> {
    pub run: &'a TestRun,
    pub jobs: &'a [JobSpec],
    pub devices: &'a BTreeSet<DeviceId>,
}

impl ToWire<InsertTboardRequest> for ShardPayload<'_> {
    fn to_wire(&self) -> InsertTboardRequest {
        InsertTboardRequest {
            tboard_id: self.run.id.0,
            board_name: self.run.name.clone(),
            owner_name: self.run.owner.clone(),
            jobs: self.jobs.iter().map(ToWire::to_wire).collect(),
            device_label_list: self.devices.iter().map(|d| d.0.clone()).collect(),
            repeat_time: self.run.repeat_count,
            create_time: self.run.created_at_ms,
        }
    }
}

/// An end-of-run callback bound to the run id taken from its URL.
#[derive(Debug, Clone, Copy)]
pub struct EndTboardCall<'a> {
    pub run_id: RunId,
    pub body: &'a EndTboardRequest,
}

impl TryToCore<ShardCompletion> for EndTboardCall<'_> {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<ShardCompletion, ConvertError> {
        if self.body.shard_status_delta.is_empty() {
            return Err(ConvertError::EmptyDelta);
        }
        let mut updates = BTreeMap::new();
        for (cabinet, code) in &self.body.shard_status_delta {
            if cabinet.trim().is_empty() {
                return Err(ConvertError::EmptyField { field: "cabinet" });
            }
            let state =
                ShardState::from_code(*code).map_err(|_| ConvertError::UnknownShardCode {
                    cabinet: cabinet.clone(),
                    code: *code,
                })?;
            if !state.is_terminal() {
                return Err(ConvertError::NonTerminalState {
                    cabinet: cabinet.clone(),
                });
            }
            updates.insert(CabinetId(cabinet.clone()), state);
        }
        Ok(ShardCompletion {
            run_id: self.run_id,
            end_time_ms: self.body.end_time,
            updates,
        })
    }
}

/// Parses an agent response body; an empty body carries no payload.
pub fn parse_agent_body(bytes: &[u8]) -> Result<Option<serde_json::Value>, serde_json::Error> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes).map(Some)
}

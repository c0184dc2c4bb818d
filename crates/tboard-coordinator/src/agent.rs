//! Calls from the coordinator to cabinet agents.
//!
//! An [`AgentClient`] makes exactly one HTTP attempt per call and reports
//! transport trouble as a [`ShardTransportError`]; it never retries.
//! [`AgentGateway`] is what the coordinators use: it applies the success rule
//! (HTTP 200), records metrics, and writes one audit entry per call.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tboard_core::types::CabinetId;
use tboard_observe::metrics::ScopedTimer;
use tboard_observe::time::unix_time_ms;
use thiserror::Error;

use crate::metrics::CoordinatorMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMethod {
    Post,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub method: AgentMethod,
    /// Agent base URL.
    pub endpoint: String,
    pub path: String,
    /// JSON body, if any.
    pub body: Option<Vec<u8>>,
}

impl AgentRequest {
    pub fn url(&self) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), self.path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub status: u16,
    /// Parsed JSON body of a 2xx response; `None` for an empty body.
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardTransportError {
    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent unreachable: {0}")]
    Connect(String),
    #[error("agent answered HTTP {0}")]
    Status(u16),
    #[error("agent response (HTTP {status}) is not valid JSON: {message}")]
    Parse { status: u16, message: String },
    #[error("agent request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait AgentClient: Send + Sync + 'static {
    /// One attempt. Returns `Ok` for any HTTP status the agent answered with.
    async fn send(
        &self,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, ShardTransportError>;
}

/// `reqwest`-backed agent client.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { http })
    }

    fn classify(err: reqwest::Error, timeout: Duration) -> ShardTransportError {
        if err.is_timeout() {
            ShardTransportError::Timeout(timeout)
        } else if err.is_connect() {
            ShardTransportError::Connect(err.to_string())
        } else {
            ShardTransportError::Request(err.to_string())
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn send(
        &self,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, ShardTransportError> {
        let url = request.url();
        let mut builder = match request.method {
            AgentMethod::Post => self.http.post(url),
            AgentMethod::Delete => self.http.delete(url),
        }
        .timeout(timeout)
        .header(reqwest::header::CONNECTION, "close");
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| Self::classify(e, timeout))?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| Self::classify(e, timeout))?;

        if !status.is_success() {
            return Ok(AgentResponse {
                status: status.as_u16(),
                body: None,
            });
        }
        let body =
            tboard_wire::parse_agent_body(&bytes).map_err(|e| ShardTransportError::Parse {
                status: status.as_u16(),
                message: e.to_string(),
            })?;
        Ok(AgentResponse {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Ok { status: u16 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub cabinet_id: CabinetId,
    pub endpoint: String,
    pub payload_digest: String,
    pub outcome: AuditOutcome,
    pub unix_time_ms: u64,
}

/// Bounded in-memory record of recent agent calls, oldest dropped first.
#[derive(Debug)]
pub struct AuditTrail {
    capacity: usize,
    records: Mutex<VecDeque<AuditRecord>>,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, record: AuditRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn recent(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Short stable digest of a request body for the audit trail.
pub fn payload_digest(bytes: &[u8]) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    format!("fnv64_{h:016x}")
}

#[derive(Clone)]
pub struct AgentGateway {
    client: Arc<dyn AgentClient>,
    audit: Arc<AuditTrail>,
    metrics: Arc<CoordinatorMetrics>,
}

impl AgentGateway {
    pub fn new(
        client: Arc<dyn AgentClient>,
        audit: Arc<AuditTrail>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            client,
            audit,
            metrics,
        }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Sends `request` and maps anything but HTTP 200 to a shard failure.
    pub async fn call(
        &self,
        cabinet_id: &CabinetId,
        request: AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, ShardTransportError> {
        let endpoint = request.url();
        let payload_digest = payload_digest(request.body.as_deref().unwrap_or_default());

        self.metrics.agent_calls_total.inc();
        let result = {
            let _timer = ScopedTimer::new(&self.metrics.agent_call_latency);
            match self.client.send(request, timeout).await {
                Ok(resp) if resp.status == 200 => Ok(resp),
                Ok(resp) => Err(ShardTransportError::Status(resp.status)),
                Err(err) => Err(err),
            }
        };

        let outcome = match &result {
            Ok(resp) => AuditOutcome::Ok {
                status: resp.status,
            },
            Err(err) => {
                self.metrics.agent_call_failures_total.inc();
                AuditOutcome::Failed {
                    error: err.to_string(),
                }
            }
        };
        tracing::info!(
            target: "tboard_audit",
            cabinet_id = %cabinet_id,
            endpoint = %endpoint,
            payload_digest = %payload_digest,
            outcome = ?outcome,
            "agent call"
        );
        self.audit.record(AuditRecord {
            cabinet_id: cabinet_id.clone(),
            endpoint,
            payload_digest,
            outcome,
            unix_time_ms: unix_time_ms(),
        });
        result
    }
}

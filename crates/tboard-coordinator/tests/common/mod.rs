#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tboard_coordinator::agent::{
    AgentClient, AgentMethod, AgentRequest, AgentResponse, ShardTransportError,
};
use tboard_coordinator::metrics::CoordinatorMetrics;
use tboard_coordinator::{Coordinator, CoordinatorConfig, DispatchRequest};
use tboard_core::types::{
    Cabinet, CabinetId, Device, DeviceId, DeviceStatus, JobId, JobSpec, RunMetadata,
};
use tboard_store::MemRunStore;

pub const CAB_A: &str = "http://cab-a:5000";
pub const CAB_B: &str = "http://cab-b:5000";
pub const CAB_C: &str = "http://cab-c:5000";

#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Json(u16, serde_json::Value),
    Fail(ShardTransportError),
}

type InsertHook = Box<dyn Fn(&AgentRequest) + Send + Sync>;

/// In-process agent farm. Unscripted calls answer 200 with no body.
#[derive(Default)]
pub struct ScriptedAgent {
    inserts: Mutex<HashMap<String, Reply>>,
    removes: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<AgentRequest>>,
    insert_hook: Mutex<Option<InsertHook>>,
}

impl ScriptedAgent {
    pub fn on_insert(&self, endpoint: &str, reply: Reply) {
        self.inserts
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), reply);
    }

    pub fn on_remove(&self, endpoint: &str, reply: Reply) {
        self.removes
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), reply);
    }

    /// Runs `hook` inside every insert call, before the reply is returned.
    pub fn before_insert_reply(&self, hook: impl Fn(&AgentRequest) + Send + Sync + 'static) {
        *self.insert_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_with(&self, method: AgentMethod) -> Vec<AgentRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }
}

#[async_trait]
impl AgentClient for ScriptedAgent {
    async fn send(
        &self,
        request: AgentRequest,
        _timeout: Duration,
    ) -> Result<AgentResponse, ShardTransportError> {
        self.calls.lock().unwrap().push(request.clone());
        let script = match request.method {
            AgentMethod::Post => &self.inserts,
            AgentMethod::Delete => &self.removes,
        };
        let reply = script
            .lock()
            .unwrap()
            .get(&request.endpoint)
            .cloned()
            .unwrap_or(Reply::Status(200));
        if request.method == AgentMethod::Post {
            if let Some(hook) = self.insert_hook.lock().unwrap().as_ref() {
                hook(&request);
            }
        }
        match reply {
            Reply::Status(status) => Ok(AgentResponse { status, body: None }),
            Reply::Json(status, body) => Ok(AgentResponse {
                status,
                body: Some(body),
            }),
            Reply::Fail(err) => Err(err),
        }
    }
}

pub fn cab(id: &str) -> CabinetId {
    CabinetId(id.to_string())
}

pub fn dev(id: &str) -> DeviceId {
    DeviceId(id.to_string())
}

pub fn job(id: &str) -> JobId {
    JobId(id.to_string())
}

fn device(id: &str, cabinet: &str, model: &str, status: DeviceStatus) -> Device {
    Device {
        id: dev(id),
        cabinet: cab(cabinet),
        phone_model: model.to_string(),
        status,
        latest_run: None,
    }
}

fn job_spec(id: &str, complete: bool, models: &[&str]) -> JobSpec {
    JobSpec {
        id: job(id),
        name: format!("{id}-name"),
        flow_type: "normal".to_string(),
        inner_jobs: Vec::new(),
        artifact_complete: complete,
        phone_models: models.iter().map(|m| m.to_string()).collect(),
    }
}

/// Cabinets A, B, C. A holds a1, a2 and the offline x1; B holds b1; C holds
/// c1, the only non-pixel device. `j-upload` is still uploading and
/// `j-pixel` only runs on pixels.
pub fn seeded_store() -> Result<MemRunStore> {
    let store = MemRunStore::new();
    store.upsert_cabinet(Cabinet {
        id: cab("A"),
        endpoint: CAB_A.to_string(),
    })?;
    store.upsert_cabinet(Cabinet {
        id: cab("B"),
        endpoint: CAB_B.to_string(),
    })?;
    store.upsert_cabinet(Cabinet {
        id: cab("C"),
        endpoint: CAB_C.to_string(),
    })?;
    store.upsert_device(device("a1", "A", "pixel", DeviceStatus::Idle))?;
    store.upsert_device(device("a2", "A", "pixel", DeviceStatus::Idle))?;
    store.upsert_device(device("x1", "A", "pixel", DeviceStatus::Offline))?;
    store.upsert_device(device("b1", "B", "pixel", DeviceStatus::Idle))?;
    store.upsert_device(device("c1", "C", "galaxy", DeviceStatus::Idle))?;
    store.upsert_device(device("z1", "Z", "pixel", DeviceStatus::Idle))?;
    store.upsert_job(job_spec("j1", true, &[]))?;
    store.upsert_job(job_spec("j-upload", false, &[]))?;
    store.upsert_job(job_spec("j-pixel", true, &["pixel"]))?;
    Ok(store)
}

pub struct Harness {
    pub store: Arc<MemRunStore>,
    pub agent: Arc<ScriptedAgent>,
    pub metrics: Arc<CoordinatorMetrics>,
    pub coordinator: Coordinator,
}

pub fn harness() -> Result<Harness> {
    let store = Arc::new(seeded_store()?);
    let agent = Arc::new(ScriptedAgent::default());
    let metrics = Arc::new(CoordinatorMetrics::default());
    let config = CoordinatorConfig {
        agent_timeout: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(200),
        ..CoordinatorConfig::default()
    };
    let coordinator = Coordinator::new(
        store.clone(),
        store.clone(),
        agent.clone(),
        config,
        metrics.clone(),
    );
    Ok(Harness {
        store,
        agent,
        metrics,
        coordinator,
    })
}

pub fn request(devices: &[&str], jobs: &[&str]) -> DispatchRequest {
    DispatchRequest {
        devices: devices.iter().map(|d| dev(d)).collect::<BTreeSet<_>>(),
        jobs: jobs.iter().map(|j| job(j)).collect(),
        repeat_count: 1,
        metadata: RunMetadata {
            name: "nightly".to_string(),
            owner: "qa".to_string(),
            description: String::new(),
        },
    }
}

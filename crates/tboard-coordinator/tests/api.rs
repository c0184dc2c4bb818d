mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use common::{cab, dev, harness, Harness, Reply, CAB_B};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use tboard_coordinator::api::{
    self, ApiState, CancelReply, DeletionReply, DispatchReply, EndTboardReply, ErrorBody,
};
use tboard_coordinator::deletion::NoArtifacts;
use tboard_coordinator::{DeletionConfig, DeletionPipeline};
use tboard_core::types::{DeviceStatus, RunId, ShardState};
use tboard_store::{DeviceDirectory, MemLedgerKv, RunStore};

struct Served {
    h: Harness,
    base: String,
    client: reqwest::Client,
}

async fn serve() -> Result<Served> {
    let h = harness()?;
    let (deletion, worker) = DeletionPipeline::new(
        h.store.clone(),
        Arc::new(MemLedgerKv::new()),
        Arc::new(NoArtifacts),
        DeletionConfig {
            retry_backoff: Duration::from_millis(1),
            ..DeletionConfig::default()
        },
        h.metrics.clone(),
    );
    tokio::spawn(worker.run());
    let app = api::router(ApiState {
        coordinator: h.coordinator.clone(),
        deletion,
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr: SocketAddr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(Served {
        h,
        base: format!("http://{addr}"),
        client: reqwest::Client::new(),
    })
}

impl Served {
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(StatusCode, T)> {
        let mut req = self.client.request(method, format!("{}{path}", self.base));
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(&body)?);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        Ok((status, serde_json::from_slice(&bytes)?))
    }
}

fn dispatch_body(devices: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "devices": devices,
        "jobs": ["j1"],
        "metadata": {"name": "nightly", "owner": "qa", "description": ""},
    })
}

#[tokio::test]
async fn completion_callback_finishes_a_dispatched_run() -> Result<()> {
    let s = serve().await?;
    let (status, reply): (_, DispatchReply) = s
        .call(Method::POST, "/tboards/", Some(dispatch_body(&["a1", "b1"])))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(reply.failed.is_empty());
    assert_eq!(reply.shards.len(), 2);
    let run_id = reply.run_id;

    let path = format!("/end_tboard/{run_id}/");
    let (status, first): (_, EndTboardReply) = s
        .call(
            Method::PUT,
            &path,
            Some(serde_json::json!({"end_time": 5_000, "shard_status_delta": {"A": 0}})),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first.applied, vec![cab("A")]);
    assert!(!first.finalized);

    let (_, last): (_, EndTboardReply) = s
        .call(
            Method::PUT,
            &path,
            Some(serde_json::json!({"end_time": 9_000, "shard_status_delta": {"B": -1}})),
        )
        .await?;
    assert!(last.finalized);

    let run = s.h.store.get_run(run_id)?;
    assert!(run.finished);
    assert_eq!(run.end_time_ms, Some(9_000));
    assert_eq!(run.shard_status.get(&cab("B")), Some(&ShardState::Failed));
    assert_eq!(s.h.store.device(&dev("b1"))?.status, DeviceStatus::Idle);

    let (status, body): (_, serde_json::Value) =
        s.call(Method::GET, &format!("/tboards/{run_id}/"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["finished"], serde_json::json!(true));
    Ok(())
}

#[tokio::test]
async fn partial_dispatch_reports_failed_cabinets() -> Result<()> {
    let s = serve().await?;
    s.h.agent.on_insert(CAB_B, Reply::Status(500));

    let (status, reply): (_, DispatchReply) = s
        .call(Method::POST, "/tboards/", Some(dispatch_body(&["a1", "b1"])))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply.failed.keys().cloned().collect::<Vec<_>>(), vec![cab("B")]);
    assert_eq!(reply.shards.keys().cloned().collect::<Vec<_>>(), vec![cab("A")]);
    Ok(())
}

#[tokio::test]
async fn errors_map_to_status_codes() -> Result<()> {
    let s = serve().await?;

    let (status, err): (_, ErrorBody) = s
        .call(Method::POST, "/tboards/", Some(dispatch_body(&["nope"])))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err.error.contains("nope"));

    let (status, _): (_, ErrorBody) = s
        .call(
            Method::PUT,
            "/end_tboard/424242/",
            Some(serde_json::json!({"shard_status_delta": {"A": 0}})),
        )
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    s.h.agent.on_insert(common::CAB_A, Reply::Status(503));
    let (status, _): (_, ErrorBody) = s
        .call(Method::POST, "/tboards/", Some(dispatch_body(&["a1"])))
        .await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    Ok(())
}

#[tokio::test]
async fn cancel_then_delete_over_http() -> Result<()> {
    let s = serve().await?;
    let (_, reply): (_, DispatchReply) = s
        .call(Method::POST, "/tboards/", Some(dispatch_body(&["a1"])))
        .await?;
    let run_id: RunId = reply.run_id;

    let (status, cancel): (_, CancelReply) = s
        .call(Method::DELETE, &format!("/tboards/{run_id}/"), None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancel.stopped, vec![cab("A")]);
    assert!(s.h.store.get_run(run_id)?.finished);

    let (status, queued): (_, DeletionReply) = s
        .call(Method::POST, &format!("/tboards/{run_id}/deletion/"), None)
        .await?;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(queued.queued);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (status, ledger): (_, serde_json::Value) =
            s.call(Method::GET, "/deletions/", None).await?;
        assert_eq!(status, StatusCode::OK);
        if ledger["active"][0]["state"] == serde_json::json!("DELETED") {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run was not deleted in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(s.h.store.get_run(run_id).is_err());
    Ok(())
}

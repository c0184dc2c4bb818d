#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, info_span, Instrument};

use tboard_coordinator::api::{self, ApiState};
use tboard_coordinator::deletion::{ArtifactStore, FsArtifactStore, NoArtifacts};
use tboard_coordinator::inventory::Inventory;
use tboard_coordinator::metrics::CoordinatorMetrics;
use tboard_coordinator::{
    Coordinator, CoordinatorConfig, DeletionConfig, DeletionPipeline, HttpAgentClient,
};
use tboard_store::{MemLedgerKv, MemRunStore};

#[derive(Debug, Parser)]
#[command(name = "tboard-coordinator")]
struct Args {
    /// Address serving agent callbacks and run operations.
    #[arg(long, env = "TBOARD_ADDR", default_value = "0.0.0.0:8300")]
    addr: SocketAddr,

    /// JSON file listing cabinets, devices, and jobs to seed the store with.
    #[arg(long, env = "TBOARD_INVENTORY_PATH")]
    inventory_path: Option<PathBuf>,

    /// Per-call timeout for shard dispatch calls.
    #[arg(long, env = "TBOARD_AGENT_TIMEOUT_MS", default_value_t = 3_000)]
    agent_timeout_ms: u64,

    #[arg(long, env = "TBOARD_AGENT_CONNECT_TIMEOUT_MS", default_value_t = 1_000)]
    agent_connect_timeout_ms: u64,

    /// Per-call timeout for shard stop calls.
    #[arg(long, env = "TBOARD_STOP_TIMEOUT_MS", default_value_t = 3_000)]
    stop_timeout_ms: u64,

    /// Max agent calls in flight per dispatch or cancel.
    #[arg(long, env = "TBOARD_DISPATCH_CONCURRENCY", default_value_t = 8)]
    dispatch_concurrency: usize,

    #[arg(long, env = "TBOARD_AUDIT_CAPACITY", default_value_t = 1024)]
    audit_capacity: usize,

    /// Deletion retries after the first failed attempt.
    #[arg(long, env = "TBOARD_DELETION_MAX_RETRIES", default_value_t = 3)]
    deletion_max_retries: u32,

    #[arg(long, env = "TBOARD_DELETION_RETRY_BACKOFF_MS", default_value_t = 5_000)]
    deletion_retry_backoff_ms: u64,

    /// How long a finished deletion stays in the ledger.
    #[arg(long, env = "TBOARD_DELETION_TICKET_TTL_SECS", default_value_t = 86_400)]
    deletion_ticket_ttl_secs: u64,

    /// Root of per-run artifact directories (`tboard_<id>`). Unset: no artifacts.
    #[arg(long, env = "TBOARD_ARTIFACT_ROOT")]
    artifact_root: Option<PathBuf>,

    /// Optional: periodically emit a metrics snapshot to logs.
    #[arg(long, env = "TBOARD_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

impl Args {
    fn config(&self) -> CoordinatorConfig {
        let defaults = DeletionConfig::default();
        CoordinatorConfig {
            agent_timeout: Duration::from_millis(self.agent_timeout_ms),
            agent_connect_timeout: Duration::from_millis(self.agent_connect_timeout_ms),
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            dispatch_concurrency: self.dispatch_concurrency,
            audit_capacity: self.audit_capacity,
            deletion: DeletionConfig {
                max_retries: self.deletion_max_retries,
                retry_backoff: Duration::from_millis(self.deletion_retry_backoff_ms),
                ticket_ttl: Duration::from_secs(self.deletion_ticket_ttl_secs),
                ..defaults
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tboard_observe::logging::init_tracing();

    let args = Args::parse();
    if args.dispatch_concurrency == 0 {
        anyhow::bail!("TBOARD_DISPATCH_CONCURRENCY must be > 0");
    }
    let config = args.config();

    let store = Arc::new(MemRunStore::new());
    if let Some(path) = &args.inventory_path {
        Inventory::load(path)?.seed(&store)?;
    }

    let artifacts: Arc<dyn ArtifactStore> = match &args.artifact_root {
        Some(root) => Arc::new(FsArtifactStore::new(root.clone())),
        None => Arc::new(NoArtifacts),
    };

    let span = info_span!(
        "tboard-coordinator",
        dispatch_concurrency = config.dispatch_concurrency,
        addr = %args.addr,
        agent_timeout_ms = args.agent_timeout_ms,
        deletion_max_retries = config.deletion.max_retries
    );
    async move {
        info!("starting coordinator");
        let metrics = Arc::new(CoordinatorMetrics::default());
        let agent = Arc::new(HttpAgentClient::new(config.agent_connect_timeout)?);
        let coordinator = Coordinator::new(
            store.clone(),
            store.clone(),
            agent,
            config.clone(),
            metrics.clone(),
        );
        let (deletion, worker) = DeletionPipeline::new(
            store.clone(),
            Arc::new(MemLedgerKv::new()),
            artifacts,
            config.deletion.clone(),
            metrics.clone(),
        );
        let worker = tokio::spawn(worker.run());

        if args.metrics_snapshot_interval_ms > 0 {
            let metrics = metrics.clone();
            let interval_ms = args.metrics_snapshot_interval_ms;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    metrics.emit_snapshot();
                }
            });
        }

        let app = api::router(ApiState {
            coordinator,
            deletion,
        });
        let listener = tokio::net::TcpListener::bind(args.addr).await?;
        info!(
            target: "tboard_proof",
            event = "coordinator_ready",
            addr = %listener.local_addr()?,
            runs = store.run_count()?,
            "coordinator ready"
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %err, "ctrl-c handler failed");
                }
                info!("shutdown requested");
            })
            .await?;

        if let Err(err) = worker.await {
            tracing::warn!(error = %err, "deletion worker ended abnormally");
        }
        metrics.emit_snapshot();
        Ok(())
    }
    .instrument(span)
    .await
}

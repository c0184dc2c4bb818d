#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod agent;
pub mod api;
pub mod cancel;
pub mod config;
pub mod coordinator;
pub mod deletion;
pub mod dispatch;
pub mod error;
mod fanout;
pub mod ingest;
pub mod inventory;
pub mod metrics;

pub use agent::{AgentClient, AgentGateway, HttpAgentClient};
pub use cancel::CancelOutcome;
pub use config::{CoordinatorConfig, DeletionConfig};
pub use coordinator::Coordinator;
pub use deletion::{DeletionPipeline, DeletionWorker, EnqueueOutcome};
pub use dispatch::{DispatchOutcome, DispatchRequest, RunHandle};
pub use error::{CancelError, DeletionError, DispatchError, IngestError, ValidationError};
pub use ingest::{AggregateMaintainer, EndOfRunOutcome, ResultChange, ResultIngestor};

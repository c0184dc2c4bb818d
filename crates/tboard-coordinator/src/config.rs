use std::time::Duration;

/// Runtime knobs of the coordinator. The daemon fills this from CLI/env.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Per-call timeout of `insert_tboard` calls.
    pub agent_timeout: Duration,
    pub agent_connect_timeout: Duration,
    /// Per-call timeout of `remove_tboard` calls.
    pub stop_timeout: Duration,
    /// Max shard calls in flight; `1` makes dispatch strictly sequential.
    pub dispatch_concurrency: usize,
    /// Agent calls kept in the in-process audit trail.
    pub audit_capacity: usize,
    pub deletion: DeletionConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_timeout: Duration::from_secs(3),
            agent_connect_timeout: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(3),
            dispatch_concurrency: 8,
            audit_capacity: 1024,
            deletion: DeletionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// How long a `DELETED` ticket stays visible.
    pub ticket_ttl: Duration,
    pub queue_capacity: usize,
    pub broadcast_capacity: usize,
}

impl Default for DeletionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_secs(5),
            ticket_ttl: Duration::from_secs(24 * 60 * 60),
            queue_capacity: 256,
            broadcast_capacity: 64,
        }
    }
}

use tboard_observe::metrics::{Counter, DurationAgg, Gauge};

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub dispatch_total: Counter,
    pub dispatch_accepted_total: Counter,
    pub dispatch_partial_total: Counter,
    pub dispatch_rejected_total: Counter,
    pub agent_calls_total: Counter,
    pub agent_call_failures_total: Counter,
    pub agent_call_latency: DurationAgg,
    pub cancel_total: Counter,
    pub results_ingested_total: Counter,
    pub shard_completions_total: Counter,
    pub runs_finalized_total: Counter,
    pub devices_released_total: Counter,
    pub stale_claims_skipped_total: Counter,
    pub deletions_enqueued_total: Counter,
    pub deletions_completed_total: Counter,
    pub deletions_failed_total: Counter,
    pub deletions_in_flight: Gauge,
    pub ledger_broadcasts_total: Counter,
}

impl CoordinatorMetrics {
    pub fn emit_snapshot(&self) {
        let latency = self.agent_call_latency.snapshot();
        tracing::info!(
            target: "tboard_metrics",
            dispatch_total = self.dispatch_total.get(),
            dispatch_accepted_total = self.dispatch_accepted_total.get(),
            dispatch_partial_total = self.dispatch_partial_total.get(),
            dispatch_rejected_total = self.dispatch_rejected_total.get(),
            agent_calls_total = self.agent_calls_total.get(),
            agent_call_failures_total = self.agent_call_failures_total.get(),
            agent_call_avg_ms = latency.avg_ms(),
            agent_call_max_ms = latency.max_ms(),
            cancel_total = self.cancel_total.get(),
            results_ingested_total = self.results_ingested_total.get(),
            shard_completions_total = self.shard_completions_total.get(),
            runs_finalized_total = self.runs_finalized_total.get(),
            devices_released_total = self.devices_released_total.get(),
            stale_claims_skipped_total = self.stale_claims_skipped_total.get(),
            deletions_enqueued_total = self.deletions_enqueued_total.get(),
            deletions_completed_total = self.deletions_completed_total.get(),
            deletions_failed_total = self.deletions_failed_total.get(),
            deletions_in_flight = self.deletions_in_flight.get(),
            ledger_broadcasts_total = self.ledger_broadcasts_total.get(),
            "metrics"
        );
    }
}

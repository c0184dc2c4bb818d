use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "TBOARD_LOG";

/// Used when neither `TBOARD_LOG` nor `RUST_LOG` holds a usable filter. HTTP
/// transport crates stay at `warn` so the `tboard_audit` agent-call events are
/// not drowned out.
pub const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,reqwest=warn";

/// Installs the global `fmt` subscriber.
///
/// Log field contract for TBoard services:
/// - `run_id` on every run lifecycle event.
/// - `cabinet_id` on shard and agent events.
/// - `device_id` when a device status is mutated or skipped.
/// - Lifecycle proof events use target `tboard_proof`, agent calls
///   `tboard_audit`, periodic counters `tboard_metrics`.
pub fn init_tracing() {
    tracing_subscriber::fmt().with_env_filter(env_filter()).init();
}

pub fn env_filter() -> EnvFilter {
    let tboard = std::env::var(LOG_ENV).ok();
    let rust = std::env::var("RUST_LOG").ok();
    filter_from(tboard.as_deref(), rust.as_deref())
}

/// First non-blank spec that parses wins; an invalid `TBOARD_LOG` falls
/// through to `RUST_LOG`.
fn filter_from(tboard: Option<&str>, rust: Option<&str>) -> EnvFilter {
    [tboard, rust]
        .into_iter()
        .flatten()
        .filter(|spec| !spec.trim().is_empty())
        .find_map(|spec| EnvFilter::try_new(spec).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

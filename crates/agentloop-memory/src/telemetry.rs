use tracing_subscriber::{fmt, EnvFilter};

/// Engine events at `info`, dependencies only when they warn.
pub const DEFAULT_LOG_FILTER: &str = "agentloop_memory=info,warn";

/// Filter used by `--verbose`: per-message and per-batch events.
pub const VERBOSE_LOG_FILTER: &str = "agentloop_memory=debug,warn";

pub fn init_tracing() -> bool {
    init_tracing_with(DEFAULT_LOG_FILTER)
}

/// Installs the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Thread names are printed so `embedding-worker` lines stand apart from the
/// caller's. Returns false when a subscriber was already installed.
pub fn init_tracing_with(default_filter: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_thread_names(true)
        .compact()
        .try_init()
        .is_ok()
}

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. Filtering follows `RUST_LOG`
/// and defaults to `info`. Later calls are no-ops.
pub fn init_logging() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
    if result.is_err() {
        tracing::debug!("logging already initialized");
    }
}

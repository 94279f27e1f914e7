use tracing_subscriber::EnvFilter;

pub const LOG_FILTER_VAR: &str = "QUERY_ASSISTANT_LOG";

/// Installs a stderr subscriber filtered by `QUERY_ASSISTANT_LOG`
/// (default `warn`). Leaves an existing global subscriber in place, since
/// the host process may have installed its own.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_FILTER_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!("logging initialized");
    }
}

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. RUST_LOG wins over `default_filter`.
/// Safe to call more than once; later calls are no-ops.
pub fn init(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .try_init();
}

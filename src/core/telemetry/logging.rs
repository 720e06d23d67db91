use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging() {
    init_logging_with_default("info");
}

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_logging_with_default(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

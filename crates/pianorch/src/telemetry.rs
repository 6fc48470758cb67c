//! Tracing subscriber setup.

use orchconf::TelemetryConfig;
use tracing_subscriber::EnvFilter;

/// Install a stderr fmt subscriber. `verbose` forces debug level; otherwise
/// the configured filter applies (config already folds in `RUST_LOG`).
pub fn init(config: &TelemetryConfig, verbose: bool) {
    let directive = if verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };

    let filter = EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("invalid log filter {directive:?} ({e}), using info");
        EnvFilter::new("info")
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

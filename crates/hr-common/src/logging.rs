//! Logging setup for the relay agent.
//!
//! All log lines go to stderr so stdout stays clean for piped consumers.
//! An optional append-mode file sink mirrors the stream to
//! `<agent home>/logs/relay.log`.
//!
//! Level resolution order: `HYVERELAY_LOG` env var, then `RUST_LOG`, then the
//! level from the configuration document.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Env var overriding the configured log level (e.g. `debug`,
/// `hr_runtime=trace`).
pub const LOG_ENV_VAR: &str = "HYVERELAY_LOG";

/// Resolve the effective filter directive.
fn resolve_filter(config_level: &str) -> EnvFilter {
    if let Ok(directive) = std::env::var(LOG_ENV_VAR) {
        if let Ok(filter) = EnvFilter::try_new(&directive) {
            return filter;
        }
    }
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config_level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize logging with the configured level and an optional file sink.
///
/// Safe to call once per process; a second call is a no-op (the global
/// subscriber is already set, which matters for test binaries).
pub fn init_logging(config_level: &str, log_file: Option<&Path>) {
    let env_filter = resolve_filter(config_level);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(true);

    let file_layer = log_file.and_then(|path| {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok()?;
        }
        let file = OpenOptions::new().append(true).create(true).open(path).ok()?;
        Some(
            fmt::layer()
                .with_writer(Arc::new(file))
                .with_target(true)
                .with_ansi(false)
                .boxed(),
        )
    });

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

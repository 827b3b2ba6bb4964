//! Subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::EnvFilter;

/// Output format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Installs a global fmt subscriber.
///
/// Uses the `RUST_LOG` env var if set, otherwise falls back to `level`.
/// Returns false if a global subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    init_logging_with(level, LogFormat::Text)
}

/// Same as [`init_logging`] with an explicit output format.
pub fn init_logging_with(level: &str, format: LogFormat) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

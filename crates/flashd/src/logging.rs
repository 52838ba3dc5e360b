//! Subscriber setup for embedders.
//!
//! Library code logs through `log` and opens `tracing` spans; these
//! helpers install a `tracing-subscriber` pipeline and route `log`
//! records into it.

use thiserror::Error;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("A log bridge is already installed: {0}")]
    Logger(#[from] log::SetLoggerError),

    #[error("A global tracing subscriber is already installed: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Installs a human-readable subscriber. `RUST_LOG` overrides
/// `default_directive` (e.g. `"info"` or `"flashd=debug"`).
pub fn init(default_directive: &str) -> Result<(), LoggingError> {
    tracing_log::LogTracer::init()?;
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer().with_target(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Same as [`init`] but emits one JSON object per line.
pub fn init_json(default_directive: &str) -> Result<(), LoggingError> {
    tracing_log::LogTracer::init()?;
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer().json().with_current_span(true));
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

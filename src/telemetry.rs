//! Global tracing subscriber management.

use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;
use tracing_log::LogTracer;
use tracing_subscriber::{EnvFilter, fmt, layer::Layer, layer::SubscriberExt};

use crate::config::AppConfig;

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] SetGlobalDefaultError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring the database driver's
/// `log::` records into the tracing pipeline. Output goes to stderr so command
/// output on stdout stays machine-readable.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    let result = install(config);
    if result.is_err() {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
    }
    result
}

fn install(config: &AppConfig) -> Result<(), TelemetryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().with_writer(std::io::stderr).pretty().boxed(),
        _ => fmt::layer().with_writer(std::io::stderr).json().boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(env_filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    // sqlx reports statements through `log`.
    LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()?;

    Ok(())
}

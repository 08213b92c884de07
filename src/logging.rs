//! # Structured Logging Module
//!
//! Installs the process-wide `tracing` subscriber: an `EnvFilter` (honoring
//! `RUST_LOG`), a console layer, and an optional non-blocking JSON file layer.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

static LOGGER_INITIALIZED: OnceLock<Option<WorkerGuard>> = OnceLock::new();

/// Initialize structured logging. Only the first call has any effect.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = || {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level))
        };

        let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

        let console = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter())
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter())
                .boxed()
        };

        layers.push(console);

        let guard = match &config.directory {
            Some(directory) => {
                let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_writer(writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(filter())
                    .boxed();
                layers.push(layer);
                Some(guard)
            }
            None => None,
        };

        // Another subscriber (e.g. a test harness) may already be installed
        if tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            level = %config.level,
            json = config.json,
            log_directory = ?config.directory,
            "Structured logging initialized"
        );

        guard
    });
}

/// Log the terminal disposition of one delivery
pub fn log_disposition(
    message_id: &str,
    disposition: &str,
    attempt: Option<u32>,
    details: Option<&str>,
) {
    tracing::info!(
        message_id = %message_id,
        disposition = %disposition,
        attempt = attempt,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "DLQ_DISPOSITION"
    );
}

/// Log an error on a message's processing path
pub fn log_reprocessing_error(
    component: &str,
    message_id: Option<&str>,
    error: &dyn std::error::Error,
    context: Option<&str>,
) {
    tracing::error!(
        component = %component,
        message_id = message_id,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "DLQ_ERROR"
    );
}

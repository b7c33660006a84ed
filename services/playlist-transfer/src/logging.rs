//!
//! src/logging.rs  Andrew Belles  Oct 2nd, 2025
//!
//! Initializes logger so every job, batch and websocket leaves a
//! structured json trail, on stdout or in daily files under LOG_DIR
//!
//!

use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tracing_error::ErrorLayer;
use tracing_appender::{non_blocking, rolling};

use crate::config::LoggingConfig;

/// Keeps the non-blocking writer flushing until main returns
pub struct LoggingGuard(#[allow(dead_code)] tracing_appender::non_blocking::WorkerGuard);

pub fn init_logging(cfg: &LoggingConfig) ->
    Result<LoggingGuard, crate::errors::TransferError> {

    let (writer, guard) = match &cfg.log_dir {
        Some(dir) => non_blocking(rolling::daily(dir, cfg.file_prefix())),
        None => non_blocking(std::io::stdout())
    };
    let filter = std::env::var("RUST_LOG")
        .ok()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new(cfg.filter_directives.clone()));

    let time = tracing_subscriber::fmt::time::UtcTime::rfc_3339();
    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_timer(time)
        .with_target(cfg.include_target)
        .with_file(cfg.include_file_line)
        .with_line_number(cfg.include_file_line)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|e| crate::errors::TransferError::Config(
            format!("logger already set: {e}")
        ))?;

    tracing::debug!(
        service = cfg.service,
        log_dir = ?cfg.log_dir,
        "logging.ready"
    );
    Ok( LoggingGuard(guard) )
}

//! Logging configuration and setup
//!
//! This module provides logging initialization and structured logging utilities
//! for conversation flows, tenant resolution and the durable mirror.

use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::utils::errors::{ConversaError, Result};

/// Initialize logging based on configuration.
///
/// Console output goes to stderr so stdout stays free for outcomes. When a file
/// path is configured a daily-rolling file layer is added; the returned guard
/// must be kept alive for buffered lines to be flushed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let (console_text, console_json) = if config.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };

    let (file_layer, guard) = match &config.file_path {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "conversa.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer().with_ansi(false).with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConversaError::Config(format!("Failed to initialize logging: {}", e)))?;

    info!("Logging initialized with level: {}", config.level);
    Ok(guard)
}

/// Log the start of a flow
pub fn log_flow_started(user_id: &str, flow: &str, step: &str) {
    info!(user_id = user_id, flow = flow, step = step, "Flow started");
}

/// Log a committed step change
pub fn log_step_changed(user_id: &str, flow: &str, from: &str, to: &str) {
    info!(
        user_id = user_id,
        flow = flow,
        from = from,
        to = to,
        "Flow step changed"
    );
}

/// Log a flow reaching a terminal step
pub fn log_flow_completed(user_id: &str, flow: &str, terminal_step: &str) {
    info!(
        user_id = user_id,
        flow = flow,
        terminal_step = terminal_step,
        "Flow completed"
    );
}

/// Log a rejected transition or payload check
pub fn log_validation_failed(user_id: &str, flow: &str, error: &str) {
    warn!(
        user_id = user_id,
        flow = flow,
        error = error,
        "Flow validation failed"
    );
}

/// Log a duplicate inbound event being skipped
pub fn log_duplicate_event(user_id: &str, event_id: &str) {
    info!(user_id = user_id, event_id = event_id, "Duplicate event skipped");
}

/// Log a tenant resolution result
pub fn log_tenant_resolved(tenant_id: &str, strategy: &str) {
    debug!(tenant_id = tenant_id, strategy = strategy, "Tenant resolved");
}

/// Log a durable mirror operation that failed or was dropped
pub fn log_mirror_failure(user_id: &str, operation: &str, error: &str) {
    error!(
        user_id = user_id,
        operation = operation,
        error = error,
        "Session mirror operation failed"
    );
}

/// Log performance metrics
pub fn log_performance_metric(metric_name: &str, value: f64, unit: &str) {
    debug!(
        metric = metric_name,
        value = value,
        unit = unit,
        "Performance metric recorded"
    );
}

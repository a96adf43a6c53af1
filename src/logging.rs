//! # Structured Logging
//!
//! Environment-aware console logging through `tracing`. Output is human-readable by
//! default and JSON when `LOG_FORMAT=json`; ANSI colors are only used on a terminal.

use crate::config::manager::detect_environment;
use chrono::Utc;
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global subscriber once
///
/// Later calls are no-ops. If another subscriber was installed first (for example by a
/// host application), it is left in place.
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let log_level = get_log_level(&environment, std::env::var("RUST_LOG").ok());
        let json = use_json(std::env::var("LOG_FORMAT").ok().as_deref());
        let use_ansi = !json && std::io::stdout().is_terminal();

        let console_layer = if json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_current_span(true)
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(EnvFilter::new(&log_level))
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                log_level = %log_level,
                json = json,
                ansi_colors = use_ansi,
                "Console logging initialized"
            );
        }
    });
}

/// Filter directive: `RUST_LOG` when set, otherwise by environment
fn get_log_level(environment: &str, rust_log: Option<String>) -> String {
    if let Some(level) = rust_log.filter(|l| !l.trim().is_empty()) {
        return level.to_lowercase();
    }

    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json(log_format: Option<&str>) -> bool {
    log_format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Log a lock acquire, release or renewal outcome
pub fn log_lock_operation(
    operation: &str,
    resource: &str,
    instances: Option<usize>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        resource = %resource,
        instances = instances,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "LOCK_OPERATION"
    );
}

/// Log a cache read, write or clear
pub fn log_cache_operation(
    operation: &str,
    namespace: &str,
    key: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        namespace = %namespace,
        key = key,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "CACHE_OPERATION"
    );
}

/// Log a task lifecycle step
pub fn log_task_operation(
    operation: &str,
    task_id: Option<&str>,
    task_type: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = task_id,
        task_type = task_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
    );
}

/// Log a system load state change
pub fn log_state_transition(from: &str, to: &str, degraded_services: usize) {
    tracing::warn!(
        from = %from,
        to = %to,
        degraded_services = degraded_services,
        timestamp = %Utc::now().to_rfc3339(),
        "STATE_TRANSITION"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}

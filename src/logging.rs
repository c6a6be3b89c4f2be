//! # Structured Logging Module
//!
//! Process-wide tracing setup plus helpers that emit one structured event per
//! task or subscription lifecycle change, so a pod's provisioning history can be
//! reconstructed from logs alone.

use crate::config::{LogFormat, LoggingConfig};
use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging. `RUST_LOG` takes precedence over the configured level.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_structured_logging(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

        let layer = match config.format {
            LogFormat::Pretty => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .boxed(),
            LogFormat::Json => fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .boxed(),
        };

        // A subscriber may already be installed by an embedding process or a test harness
        if tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized");
        }

        tracing::info!(
            pid = std::process::id(),
            format = ?config.format,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// Log structured data for task operations
pub fn log_task_operation(
    operation: &str,
    task_id: Uuid,
    subscription_id: Uuid,
    task_type: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        task_id = %task_id,
        subscription_id = %subscription_id,
        task_type = %task_type,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 TASK_OPERATION"
    );
}

/// Log structured data for subscription status changes
pub fn log_subscription_operation(
    operation: &str,
    subscription_id: Uuid,
    from_status: &str,
    to_status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        subscription_id = %subscription_id,
        from_status = %from_status,
        to_status = %to_status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📦 SUBSCRIPTION_OPERATION"
    );
}

/// Log structured data for external adapter calls
pub fn log_adapter_operation(
    adapter: &str,
    operation: &str,
    task_id: Uuid,
    status: &str,
    duration_ms: Option<u64>,
    details: Option<&str>,
) {
    tracing::info!(
        adapter = %adapter,
        operation = %operation,
        task_id = %task_id,
        status = %status,
        duration_ms = duration_ms,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "🔌 ADAPTER_OPERATION"
    );
}

/// Log structured data for worker lifecycle events
pub fn log_worker_operation(worker_id: &str, operation: &str, details: Option<&str>) {
    tracing::info!(
        worker_id = %worker_id,
        operation = %operation,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "👷 WORKER_OPERATION"
    );
}

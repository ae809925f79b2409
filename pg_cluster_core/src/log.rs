//! Structured logging for the cluster agent
//!
//! This module provides structured logging using the `tracing` crate with
//! console output on stderr and optional file logging through
//! `tracing-appender`.

use crate::config::{LogFormat, LogLevel, LoggingConfig};
use std::path::Path;
use std::sync::{Once, OnceLock};
use std::time::Duration;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

static INIT: Once = Once::new();
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        init_logging_inner(config);
    });
}

fn init_logging_inner(config: &LoggingConfig) {
    let level = convert_log_level(&config.level);
    let writer = make_writer(config.file_path.as_deref());

    let builder = tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(UtcTime::rfc_3339())
        .with_max_level(level)
        .with_writer(writer);

    // A subscriber may already be installed by an embedding test harness
    let installed = match config.format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Text => builder.try_init().is_ok(),
    };

    if installed {
        tracing::info!(
            "Logging system initialized with level: {:?}, format: {:?}",
            config.level,
            config.format
        );
    }
}

fn make_writer(file_path: Option<&str>) -> BoxMakeWriter {
    let Some(file_path) = file_path else {
        return BoxMakeWriter::new(std::io::stderr);
    };

    let path = Path::new(file_path);
    let (directory, file_name) = match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => (dir, name),
        _ => return BoxMakeWriter::new(std::io::stderr),
    };

    let appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = FILE_GUARD.set(guard);
    BoxMakeWriter::new(std::io::stderr.and(non_blocking))
}

/// Convert our log level to tracing level
fn convert_log_level(level: &LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log an operation against the database or the replication tool
pub fn log_node_operation(
    operation: &str,
    node: &str,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let span = tracing::info_span!(
        "node_operation",
        operation = operation,
        node = node,
        success = success,
        duration_ms = duration.as_millis() as u64,
        detail = tracing::field::Empty,
    );

    if let Some(fields) = additional_fields {
        let detail = fields
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(" ");
        span.record("detail", detail.as_str());
    }

    let _enter = span.enter();

    if success {
        tracing::info!("Node operation completed successfully");
    } else {
        tracing::error!("Node operation failed");
    }
}

/// Log a change to the primary marker
pub fn log_topology_change(
    change: &str,
    node: &str,
    previous: Option<&str>,
    epoch: Option<u64>,
) {
    let span = tracing::info_span!(
        "topology_change",
        change = change,
        node = node,
        previous = previous.unwrap_or("none"),
        epoch = epoch.unwrap_or_default(),
    );

    let _enter = span.enter();
    tracing::info!("Topology change recorded");
}

/// Log a state machine transition
pub fn log_state_transition(node: &str, from: &str, to: &str, reason: &str) {
    let span = tracing::info_span!(
        "state_transition",
        node = node,
        from = from,
        to = to,
        reason = reason,
    );

    let _enter = span.enter();
    tracing::info!("Node state changed from {} to {}", from, to);
}

/// Log agent startup
pub fn log_startup(version: &str, node: &str, command: &str) {
    tracing::info!(
        version = version,
        node = node,
        command = command,
        "pg-cluster agent starting"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(convert_log_level(&LogLevel::Error), Level::ERROR);
        assert_eq!(convert_log_level(&LogLevel::Warn), Level::WARN);
        assert_eq!(convert_log_level(&LogLevel::Info), Level::INFO);
        assert_eq!(convert_log_level(&LogLevel::Debug), Level::DEBUG);
        assert_eq!(convert_log_level(&LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_logging_initialization_is_repeatable() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }

    #[test]
    fn test_structured_helpers_do_not_panic() {
        log_node_operation(
            "standby_clone",
            "postgresql-1",
            true,
            Duration::from_millis(1500),
            Some(vec![("upstream", "postgresql-postgresql-0".to_string())]),
        );
        log_node_operation("node_rejoin", "postgresql-0", false, Duration::ZERO, None);
        log_topology_change("claim", "postgresql-1", Some("postgresql-0"), Some(3));
        log_state_transition("postgresql-1", "Standby", "Primary", "promote callback");
    }
}

//! Error taxonomy for the cluster agent
//!
//! Every failure is classified into one of a small number of kinds. Only
//! transient failures are retried; everything else terminates the process so
//! the pod supervisor can restart reconciliation from observed state.

use std::time::Duration;
use thiserror::Error;

/// Broad classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection refused, API unavailable, no primary yet
    Transient,
    /// Bad replication tool or agent configuration
    Configuration,
    /// Local database cannot be trusted without operator intervention
    DataIntegrity,
    /// Shared state contradicts itself (e.g. two primaries observed)
    InvariantViolation,
    /// Anything else that must stop the process
    Fatal,
}

/// Errors raised by the cluster agent
#[derive(Error, Debug)]
pub enum ClusterError {
    /// No node currently holds the primary marker
    #[error("no primary is available yet")]
    NoPrimary,

    /// More than one node holds the primary marker
    #[error("invariant violation: multiple primaries labeled: {0:?}")]
    MultiplePrimaries(Vec<String>),

    /// Recoverable external failure
    #[error("transient failure: {0}")]
    Transient(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Required environment variable is missing or malformed
    #[error("environment variable {name}: {reason}")]
    Environment { name: String, reason: String },

    /// Local data cannot be brought back without operator action
    #[error("data integrity risk: {0}")]
    DataIntegrity(String),

    /// An external command exited unsuccessfully
    #[error("command `{command}` failed with {}", describe_exit(.code))]
    Command {
        command: String,
        code: Option<i32>,
        retryable: bool,
    },

    /// A retried operation ran past its wall-clock ceiling
    #[error("{operation} did not succeed within {elapsed:?}: {source}")]
    RetryExhausted {
        operation: String,
        elapsed: Duration,
        #[source]
        source: Box<ClusterError>,
    },

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// SQL session error
    #[error("database session error: {0}")]
    Sql(#[from] tokio_postgres::Error),

    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file could not be parsed
    #[error("settings parse error: {0}")]
    Settings(String),

    /// The node state machine refused a transition
    #[error("illegal transition from {from} on {event}")]
    IllegalTransition { from: String, event: String },
}

/// Result type for cluster agent operations
pub type Result<T> = std::result::Result<T, ClusterError>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}

impl ClusterError {
    /// Create a transient error
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a data integrity error
    pub fn data_integrity(message: impl Into<String>) -> Self {
        Self::DataIntegrity(message.into())
    }

    /// Create a missing environment variable error
    pub fn missing_env(name: &str) -> Self {
        Self::Environment {
            name: name.to_string(),
            reason: "not set".to_string(),
        }
    }

    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoPrimary | Self::Transient(_) => ErrorKind::Transient,
            Self::MultiplePrimaries(_) => ErrorKind::InvariantViolation,
            Self::Configuration(_) | Self::Environment { .. } | Self::Settings(_) => {
                ErrorKind::Configuration
            }
            Self::DataIntegrity(_) => ErrorKind::DataIntegrity,
            Self::Command { retryable, .. } => {
                if *retryable {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            Self::Kube(e) => classify_kube(e),
            Self::Sql(e) => {
                // Server-side errors are deterministic; connection errors are not.
                if e.as_db_error().is_some() {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Transient
                }
            }
            Self::RetryExhausted { .. } | Self::Io(_) | Self::IllegalTransition { .. } => {
                ErrorKind::Fatal
            }
        }
    }

    /// Check if this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::InvariantViolation)
    }

    /// Check if the Kubernetes API rejected a create because the object exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(resp)) if resp.code == 409)
    }
}

fn classify_kube(error: &kube::Error) -> ErrorKind {
    match error {
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 || resp.code == 422 => {
            ErrorKind::Configuration
        }
        kube::Error::Api(resp) if resp.code == 409 => ErrorKind::Transient,
        kube::Error::Api(resp) if resp.code >= 500 || resp.code == 429 => ErrorKind::Transient,
        kube::Error::Api(_) => ErrorKind::Fatal,
        _ => ErrorKind::Transient,
    }
}

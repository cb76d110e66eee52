use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Invalid storage size format: {0}")]
    InvalidSizeFormat(String),

    #[error("Unknown storage size dimension: {0}")]
    UnknownDimension(String),

    #[error("Missing configuration: {0} must be defined")]
    MissingConfig(&'static str),

    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to connect to ClickHouse after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("{operation} timed out after {timeout:?}: {last_error}")]
    QueryTimeout {
        operation: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("ClickHouse error: {0}")]
    Database(String),

    #[error("Invalid response from ClickHouse: {0}")]
    InvalidResponse(String),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl MonitorError {
    /// Errors after which the process must not keep running.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidSizeFormat(_)
                | Self::UnknownDimension(_)
                | Self::MissingConfig(_)
                | Self::InvalidConfig { .. }
                | Self::Config(_)
                | Self::ConnectionTimeout(_)
                | Self::InvariantViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_timeout_names_operation() {
        let err = MonitorError::QueryTimeout {
            operation: "get disk usage".to_string(),
            timeout: Duration::from_secs(10),
            last_error: "connection refused".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("get disk usage timed out"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(MonitorError::MissingConfig("TABLE_NAME").is_fatal());
        assert!(MonitorError::InvariantViolation("negative".into()).is_fatal());
        assert!(!MonitorError::Database("boom".into()).is_fatal());
    }
}

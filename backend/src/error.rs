// 错误类型定义
// Error types shared by the polling pipeline

use std::time::Duration;
use thiserror::Error;

/// Failure of a single register read against a field device.
///
/// Never leaves the device reader: it is logged there and folded into
/// [`crate::types::Reading::Failed`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("Protocol error: {0}")]
    ProtocolError(String),
    #[error("Device exception: {0}")]
    Exception(String),
    #[error("Malformed response: expected {expected} values, got {got}")]
    ShortResponse { expected: usize, got: usize },
    #[error("Unsupported decode kind '{0}'")]
    UnsupportedDecode(String),
}

/// A level transform rejected its input or produced an unusable value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Transform produced a non-finite value from {0}")]
    NonFinite(f64),
    #[error("Transform rejected input: {0}")]
    Rejected(String),
}

/// Failure reported by a persistence adapter.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Row rejected: {0}")]
    Rejected(String),
}

/// Semantic problems found while loading configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Duplicate device '{0}'")]
    DuplicateDevice(String),
    #[error("Duplicate metric '{metric}' in job '{job}'")]
    DuplicateMetric { job: String, metric: String },
    #[error("Register '{metric}' in job '{job}' references unknown device '{device}'")]
    UnknownDevice { job: String, metric: String, device: String },
    #[error("Field '{field}' in job '{job}' references unknown metric '{metric}'")]
    UnknownMetric { job: String, field: String, metric: String },
    #[error("Job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },
}

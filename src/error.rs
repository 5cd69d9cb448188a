use thiserror::Error;

/// Custom error type for the pulse core operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PulseError {
    /// Bad caller input. Fatal to the single call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Malformed or mistyped point. Logged and dropped; the surrounding batch continues.
    #[error("Skipped data point at {timestamp} on {path}: {reason}")]
    SkippableData {
        path: String,
        timestamp: i64,
        reason: String,
    },

    /// The write queue is saturated and the submission was rejected.
    #[error("Write queue full: {queued}/{capacity} tasks pending")]
    Backpressure { queued: usize, capacity: usize },

    /// A chunk read back from the store breaks the bucketing invariants.
    #[error("Consistency violation in chunk {chunk_id}: {details}")]
    ConsistencyViolation { chunk_id: String, details: String },

    /// The impacted measure graph contains a cycle; the whole run is aborted.
    #[error("Cycle detected in measure graph at {path}")]
    CycleDetected { path: String },

    #[error("Measure {path} evaluation failed: {reason}")]
    MeasureEvaluationFailed { path: String, reason: String },

    #[error("Script for {path} failed: {reason}")]
    ScriptEvaluationFailed {
        path: String,
        reason: String,
        log_output: Vec<String>,
    },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("I/O Error: {0}")]
    Io(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Background task error: {0}")]
    BackgroundTaskError(String),
}

impl From<std::io::Error> for PulseError {
    fn from(err: std::io::Error) -> Self {
        PulseError::Io(err.to_string())
    }
}

impl From<bincode::Error> for PulseError {
    fn from(err: bincode::Error) -> Self {
        PulseError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for PulseError {
    fn from(err: config::ConfigError) -> Self {
        PulseError::Config(err.to_string())
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for PulseError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PulseError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}

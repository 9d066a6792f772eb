use thiserror::Error;

use crate::record::Tid;

/// Main error type for the hyperstore system
#[derive(Error, Debug)]
pub enum HsError {
    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Arrow error: {0}")]
    Arrow(String),

    #[error("Parquet error: {0}")]
    Parquet(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Errors raised when reading trials out of a store
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("Trial not found: {tid}")]
    NotFound { tid: Tid },

    #[error("Invalid trial state: {message}")]
    InvalidState { message: String },

    #[error("Trial {tid} has a NaN loss")]
    NanLoss { tid: Tid },

    #[error("Corrupted trial record: {message}")]
    CorruptedRecord { message: String },
}

/// Errors surfaced by a job queue backend
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue unavailable: {message}")]
    Unavailable { message: String },

    #[error("Job not found: {tid}")]
    JobNotFound { tid: Tid },

    #[error("Queue rejected request: {reason}")]
    Rejected { reason: String },
}

/// Errors raised while loading data, building or training a model
#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("Data provider failed: {message}")]
    Data { message: String },

    #[error("Model failed: {message}")]
    Model { message: String },

    #[error("Metric failed: {message}")]
    Metric { message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for hyperstore operations
pub type HsResult<T> = Result<T, HsError>;

impl From<anyhow::Error> for HsError {
    fn from(err: anyhow::Error) -> Self {
        HsError::Training(TrainingError::Other(err))
    }
}

impl HsError {
    /// Shorthand for [`TrialError::InvalidState`].
    pub fn invalid_state(message: impl Into<String>) -> Self {
        TrialError::InvalidState {
            message: message.into(),
        }
        .into()
    }

    /// Shorthand for [`TrialError::CorruptedRecord`].
    pub fn corrupted(message: impl Into<String>) -> Self {
        TrialError::CorruptedRecord {
            message: message.into(),
        }
        .into()
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HsError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HsError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HsError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = TrialError::NotFound { tid: 42 };
        assert!(error.to_string().contains("not found"));
        assert!(error.to_string().contains("42"));
    }

    #[test]
    fn test_error_conversion() {
        let queue_error = QueueError::JobNotFound { tid: 7 };
        let hs_error: HsError = queue_error.into();

        match hs_error {
            HsError::Queue(_) => (),
            _ => panic!("Expected Queue error"),
        }
    }

    #[test]
    fn test_anyhow_becomes_training_error() {
        let err: HsError = anyhow::anyhow!("gpu on fire").into();
        match err {
            HsError::Training(TrainingError::Other(inner)) => {
                assert_eq!(inner.to_string(), "gpu on fire")
            }
            other => panic!("Expected Training error, got {other:?}"),
        }
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("Invalid value: {}", 42);
        assert!(matches!(validation_err, HsError::Validation(_)));
        let _internal_err = internal_error!("Something went wrong");
        let config_err = config_error!("Missing required field: {}", "loss_metric");
        assert_eq!(
            config_err.to_string(),
            "Configuration error: Missing required field: loss_metric"
        );
    }
}

//! Error types for the pretraining core.
//!
//! Every fallible operation in the crate returns [`TrainResult`]. Variants
//! carry enough context (paths, steps) for the operator to act on them
//! without a backtrace.

use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// Checkpoint save/load failures
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Optimizer-specific errors
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Dataset or tokenizer access failures
    #[error("Data loading error: {0}")]
    DataLoading(String),

    /// Configuration validation failures
    #[error("Configuration error: {0}")]
    Config(String),

    /// Process group setup or collective failures
    #[error("Distributed error: {0}")]
    Distributed(String),

    /// Non-finite loss outside the scaled-precision recovery path
    #[error("Training diverged at step {step}: loss={loss}")]
    Divergence { loss: f64, step: usize },

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },

    /// (De)serialization of JSON artifacts
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Prefetch worker panics
    #[error("Worker panic: {0}")]
    WorkerPanic(String),
}

/// Result type alias for training operations
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            TrainError::Checkpoint { path, .. } => Some(path),
            TrainError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(err: serde_json::Error) -> Self {
        TrainError::Serialization(err.to_string())
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_extraction() {
        let err = checkpoint_error("failed", "/tmp/checkpoint");
        assert_eq!(err.path(), Some("/tmp/checkpoint"));

        let other_err = TrainError::Optimizer("failed".to_string());
        assert_eq!(other_err.path(), None);
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let train_result: TrainResult<()> = result.with_path("/tmp/missing.txt");

        match train_result {
            Err(TrainError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.txt"),
            _ => panic!("Expected IO error with path"),
        }
    }

    #[test]
    fn test_divergence_message_names_step() {
        let err = TrainError::Divergence {
            loss: f64::INFINITY,
            step: 12,
        };
        assert!(err.to_string().contains("step 12"));
    }
}

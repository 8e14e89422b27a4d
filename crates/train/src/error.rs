//! Error types for the training stack.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TrainError {
    /// Loss became NaN or infinite. No checkpoint is written for the epoch.
    #[error("Loss is {loss}, stopping training (epoch {epoch}, step {step})")]
    Divergence { loss: f64, epoch: usize, step: usize },

    #[error("Failed to read or write checkpoint {path}: {message}")]
    Checkpoint { path: PathBuf, message: String },

    #[error("Data loading error: {0}")]
    DataLoading(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn checkpoint(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::Checkpoint {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn is_divergence(&self) -> bool {
        matches!(self, TrainError::Divergence { .. })
    }
}

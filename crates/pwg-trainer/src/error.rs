//! Error types for the trainer crate.

use mlx_rs::error::Exception;
use pwg_vocoder::VocoderError;
use thiserror::Error;

/// Result type for training operations.
pub type Result<T> = std::result::Result<T, TrainerError>;

/// Error type for training operations.
#[derive(Error, Debug)]
pub enum TrainerError {
    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Model or loss error.
    #[error("Vocoder error: {0}")]
    Vocoder(#[from] VocoderError),

    /// Invalid optimizer or training configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A loss or gradient became NaN or infinite.
    #[error("Non-finite {what} at step {step}")]
    NonFinite {
        /// Which quantity was non-finite.
        what: String,
        /// Global step at which it was detected.
        step: u64,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrainerError {
    /// Whether this error is a configuration error, including model configs.
    pub fn is_config(&self) -> bool {
        match self {
            Self::Config(_) => true,
            Self::Vocoder(e) => e.is_config(),
            _ => false,
        }
    }

    /// Whether this error is a runtime shape error from the models.
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::Vocoder(e) if e.is_shape())
    }

    /// Whether this error reports a non-finite loss or gradient.
    pub fn is_non_finite(&self) -> bool {
        matches!(self, Self::NonFinite { .. })
    }
}

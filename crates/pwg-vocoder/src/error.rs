//! Error types for the vocoder crate.

use mlx_rs::error::Exception;
use thiserror::Error;

/// Result type for vocoder operations.
pub type Result<T> = std::result::Result<T, VocoderError>;

/// Error type for vocoder operations.
#[derive(Error, Debug)]
pub enum VocoderError {
    /// MLX operation error.
    #[error("MLX error: {0}")]
    Mlx(#[from] Exception),

    /// Invalid or inconsistent construction parameters.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shape mismatch error.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<i32>,
        /// Actual shape.
        actual: Vec<i32>,
    },

    /// Runtime tensor length or rank mismatch that has no single expected shape.
    #[error("Shape error: {0}")]
    Shape(String),
}

impl VocoderError {
    /// Whether this error comes from construction-time validation.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Whether this error is a runtime shape mismatch.
    pub fn is_shape(&self) -> bool {
        matches!(self, Self::ShapeMismatch { .. } | Self::Shape(_))
    }
}

/// Check that `x` has rank 3 with the given channel count.
pub(crate) fn expect_ncl(x: &mlx_rs::Array, channels: i32, what: &str) -> Result<()> {
    if x.ndim() != 3 {
        return Err(VocoderError::Shape(format!(
            "{what} must be (batch, channels, time), got rank {} shape {:?}",
            x.ndim(),
            x.shape()
        )));
    }
    if x.dim(1) != channels {
        return Err(VocoderError::ShapeMismatch {
            expected: vec![x.dim(0), channels, x.dim(2)],
            actual: x.shape().to_vec(),
        });
    }
    Ok(())
}

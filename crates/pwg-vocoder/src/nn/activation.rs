//! Nonlinearities selectable by name from configuration.
//!
//! Configuration files name activations the way the reference training
//! recipes do (`"LeakyReLU"` plus a parameter record). Names are resolved
//! once, at construction, into the closed [`Activation`] enum so that an
//! unknown name fails before any tensor is touched.

use crate::error::{Result, VocoderError};
use mlx_rs::Array;
use serde::{Deserialize, Serialize};

/// Keyword parameters accompanying an activation name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivationParams {
    /// Slope for negative inputs (LeakyReLU).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_slope: Option<f32>,
    /// Saturation scale for negative inputs (ELU).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alpha: Option<f32>,
}

impl ActivationParams {
    /// Parameters for a LeakyReLU with the given slope.
    pub fn negative_slope(slope: f32) -> Self {
        Self {
            negative_slope: Some(slope),
            alpha: None,
        }
    }
}

/// Supported activation functions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    /// max(x, 0)
    ReLU,
    /// x for x > 0, slope·x otherwise.
    LeakyReLU {
        /// Slope for negative inputs.
        negative_slope: f32,
    },
    /// x for x > 0, alpha·(exp(x) − 1) otherwise.
    ELU {
        /// Saturation scale.
        alpha: f32,
    },
    /// Hyperbolic tangent.
    Tanh,
    /// Gaussian error linear unit.
    GELU,
}

impl Activation {
    /// Resolve an activation from its configuration name and parameters.
    pub fn from_name(name: &str, params: &ActivationParams) -> Result<Self> {
        let reject = |key: &str| {
            VocoderError::Config(format!("activation {name} does not take parameter {key}"))
        };

        let activation = match name {
            "ReLU" => Self::ReLU,
            "LeakyReLU" => Self::LeakyReLU {
                negative_slope: params.negative_slope.unwrap_or(0.01),
            },
            "ELU" => Self::ELU {
                alpha: params.alpha.unwrap_or(1.0),
            },
            "Tanh" => Self::Tanh,
            "GELU" => Self::GELU,
            other => {
                return Err(VocoderError::Config(format!(
                    "unsupported activation {other:?} (expected one of ReLU, LeakyReLU, ELU, Tanh, GELU)"
                )))
            }
        };

        if params.negative_slope.is_some() && !matches!(activation, Self::LeakyReLU { .. }) {
            return Err(reject("negative_slope"));
        }
        if params.alpha.is_some() && !matches!(activation, Self::ELU { .. }) {
            return Err(reject("alpha"));
        }

        Ok(activation)
    }

    /// Configuration name of this activation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReLU => "ReLU",
            Self::LeakyReLU { .. } => "LeakyReLU",
            Self::ELU { .. } => "ELU",
            Self::Tanh => "Tanh",
            Self::GELU => "GELU",
        }
    }

    /// Apply the activation elementwise.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let y = match *self {
            Self::ReLU => mlx_rs::nn::relu(x)?,
            Self::LeakyReLU { negative_slope } => mlx_rs::nn::leaky_relu(x, negative_slope)?,
            Self::ELU { alpha } => {
                let zero = Array::from_f32(0.0);
                let negative = x
                    .exp()?
                    .subtract(&Array::from_f32(1.0))?
                    .multiply(&Array::from_f32(alpha))?;
                mlx_rs::ops::r#where(&x.gt(&zero)?, x, &negative)?
            }
            Self::Tanh => mlx_rs::ops::tanh(x)?,
            Self::GELU => mlx_rs::nn::gelu(x)?,
        };
        Ok(y)
    }
}

/// Gated activation unit: tanh(a) · sigmoid(b).
pub fn gated_tanh(a: &Array, b: &Array) -> Result<Array> {
    let filter = mlx_rs::ops::tanh(a)?;
    let gate = mlx_rs::ops::sigmoid(b)?;
    Ok(filter.multiply(&gate)?)
}

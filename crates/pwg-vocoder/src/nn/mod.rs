//! Neural network layers for Parallel WaveGAN.
//!
//! This module provides the core building blocks:
//! - Named activations and the gated tanh unit
//! - 1D/2D convolutions with optional weight normalization
//! - Gated residual blocks with auxiliary conditioning

mod activation;
mod conv;
mod residual_block;

pub use activation::{gated_tanh, Activation, ActivationParams};
pub use conv::{Conv1d, Conv2d, ConvWeight};
pub use residual_block::{ResidualBlock, ResidualBlockConfig};

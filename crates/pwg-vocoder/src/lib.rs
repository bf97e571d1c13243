//! Parallel WaveGAN neural vocoder on MLX.
//!
//! This crate implements the trainable model surface of Parallel WaveGAN:
//! a non-autoregressive WaveNet generator that turns Gaussian noise and
//! upsampled acoustic features into a waveform, a fully convolutional
//! discriminator, and the multi-resolution STFT loss used as the auxiliary
//! training objective.
//!
//! # Architecture
//!
//! Parallel WaveGAN uses:
//! - Nearest-neighbour + 2D smoothing stages to upsample conditioning
//! - Dilated gated residual blocks with conditioning injection
//! - A dilated 1D convolution stack as the discriminator
//! - Spectral convergence and log-magnitude losses over several STFT resolutions
//!
//! # Example
//!
//! ```ignore
//! use pwg_vocoder::{GeneratorConfig, ParallelWaveGanGenerator, RandomSource};
//!
//! let generator = ParallelWaveGanGenerator::new(GeneratorConfig::default())?;
//! let mut rng = RandomSource::new(0);
//!
//! // Generate audio from a mel-spectrogram
//! let mel = /* [batch, 80, frames] */;
//! let audio = generator.generate(&mel, &mut rng)?;
//! ```

// Crate-level lint configuration for ML/GPU code patterns
#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_borrows_for_generic_args)]

pub mod audio;
pub mod config;
pub mod discriminator;
pub mod error;
pub mod generator;
pub mod loss;
pub mod nn;
pub mod random;
pub mod upsample;

pub use config::*;
pub use discriminator::ParallelWaveGanDiscriminator;
pub use error::*;
pub use generator::ParallelWaveGanGenerator;
pub use loss::{discriminator_adversarial_loss, generator_adversarial_loss, MultiResolutionStftLoss};
pub use random::RandomSource;

//! Loss functions for Parallel WaveGAN training.
//!
//! Parallel WaveGAN uses a combination of losses:
//! - Least-squares adversarial loss (generator and discriminator)
//! - Multi-resolution STFT loss (spectral convergence + log magnitude)

mod adversarial;
mod stft_loss;

pub use adversarial::{discriminator_adversarial_loss, generator_adversarial_loss};
pub use stft_loss::{log_stft_magnitude_loss, spectral_convergence_loss, MultiResolutionStftLoss, StftLoss};

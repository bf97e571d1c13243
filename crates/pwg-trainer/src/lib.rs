//! Adversarial training for Parallel WaveGAN vocoders.
//!
//! Provides the Rectified Adam optimizer, gradient-norm utilities and the
//! two-phase training step that alternates generator and discriminator
//! updates.
//!
//! # Example
//!
//! ```ignore
//! use pwg_trainer::{TrainingConfig, TrainingSession, VocoderBatch};
//!
//! let config = TrainingConfig::from_file("conf/parallel_wavegan.json")?;
//! let mut session = TrainingSession::new(&config)?;
//!
//! for (audio, mel) in loader {
//!     let stats = session.train_step(&VocoderBatch::new(audio, mel))?;
//!     println!("step {} loss {:.4}", stats.step, stats.generator_loss);
//! }
//! ```

#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod error;
pub mod grad;
pub mod radam;
pub mod trainer;

pub use config::{TrainStepConfig, TrainingConfig};
pub use error::{Result, TrainerError};
pub use grad::{clip_by_global_norm, ensure_finite, global_norm};
pub use radam::{RAdam, RAdamConfig, Rectification, RECTIFICATION_THRESHOLD};
pub use trainer::{StepStats, TrainingSession, VocoderBatch, VocoderTrainer};

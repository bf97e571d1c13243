//! Training configuration.
//!
//! Mirrors the layout of Parallel WaveGAN recipe files: one parameter block
//! per model, one per optimizer, the STFT loss block and the adversarial
//! training knobs.

use std::path::Path;

use pwg_vocoder::{DiscriminatorConfig, GeneratorConfig, StftLossConfig};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};
use crate::radam::RAdamConfig;

/// Adversarial training-step knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainStepConfig {
    /// Weight of the adversarial term in the generator loss.
    #[serde(default = "default_lambda_adv")]
    pub lambda_adv: f32,

    /// Steps of spectral-only generator training before the adversarial
    /// term and discriminator updates begin.
    #[serde(default)]
    pub discriminator_train_start_steps: u64,

    /// Global gradient norm limit for the generator (≤ 0 disables).
    #[serde(default = "default_generator_grad_norm")]
    pub generator_grad_norm: f32,

    /// Global gradient norm limit for the discriminator (≤ 0 disables).
    #[serde(default = "default_discriminator_grad_norm")]
    pub discriminator_grad_norm: f32,

    /// Seed of the trainer's random source (noise and dropout).
    #[serde(default)]
    pub seed: u64,

    /// Emit an `info!` record every this many steps (0 disables).
    #[serde(default = "default_log_interval_steps")]
    pub log_interval_steps: u64,
}

impl Default for TrainStepConfig {
    fn default() -> Self {
        Self {
            lambda_adv: default_lambda_adv(),
            discriminator_train_start_steps: 0,
            generator_grad_norm: default_generator_grad_norm(),
            discriminator_grad_norm: default_discriminator_grad_norm(),
            seed: 0,
            log_interval_steps: default_log_interval_steps(),
        }
    }
}

impl TrainStepConfig {
    /// Validate the knobs.
    pub fn validate(&self) -> Result<()> {
        if !(self.lambda_adv >= 0.0 && self.lambda_adv.is_finite()) {
            return Err(TrainerError::Config(format!(
                "lambda_adv must be a non-negative number, got {}",
                self.lambda_adv
            )));
        }
        if !self.generator_grad_norm.is_finite() || !self.discriminator_grad_norm.is_finite() {
            return Err(TrainerError::Config("gradient norm limits must be finite".into()));
        }
        Ok(())
    }
}

/// Complete training configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Generator architecture.
    #[serde(default)]
    pub generator_params: GeneratorConfig,

    /// Discriminator architecture.
    #[serde(default)]
    pub discriminator_params: DiscriminatorConfig,

    /// Multi-resolution STFT loss.
    #[serde(default)]
    pub stft_loss_params: StftLossConfig,

    /// Generator optimizer.
    #[serde(default = "default_generator_optimizer_params")]
    pub generator_optimizer_params: RAdamConfig,

    /// Discriminator optimizer.
    #[serde(default = "default_discriminator_optimizer_params")]
    pub discriminator_optimizer_params: RAdamConfig,

    /// Training-step knobs.
    #[serde(default, flatten)]
    pub train_step: TrainStepConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            generator_params: GeneratorConfig::default(),
            discriminator_params: DiscriminatorConfig::default(),
            stft_loss_params: StftLossConfig::default(),
            generator_optimizer_params: default_generator_optimizer_params(),
            discriminator_optimizer_params: default_discriminator_optimizer_params(),
            train_step: TrainStepConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&contents)?;
        tracing::info!(path = %path.display(), "loaded training configuration");
        Ok(config)
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Validate every block.
    pub fn validate(&self) -> Result<()> {
        self.generator_params.validate()?;
        self.discriminator_params.validate()?;
        self.stft_loss_params.validate()?;
        self.generator_optimizer_params.validate()?;
        self.discriminator_optimizer_params.validate()?;
        self.train_step.validate()?;
        if self.generator_params.out_channels != self.discriminator_params.in_channels {
            return Err(TrainerError::Config(format!(
                "generator produces {} channels but the discriminator expects {}",
                self.generator_params.out_channels, self.discriminator_params.in_channels
            )));
        }
        Ok(())
    }
}

fn default_lambda_adv() -> f32 {
    4.0
}
fn default_generator_grad_norm() -> f32 {
    10.0
}
fn default_discriminator_grad_norm() -> f32 {
    1.0
}
fn default_log_interval_steps() -> u64 {
    100
}
fn default_generator_optimizer_params() -> RAdamConfig {
    RAdamConfig::default().with_lr(1e-4).with_eps(1e-6)
}
fn default_discriminator_optimizer_params() -> RAdamConfig {
    RAdamConfig::default().with_lr(5e-5).with_eps(1e-6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_validates() {
        let config = TrainingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.train_step.lambda_adv, 4.0);
        assert_eq!(config.generator_optimizer_params.lr, 1e-4);
        assert_eq!(config.discriminator_optimizer_params.lr, 5e-5);
    }

    #[test]
    fn test_from_json_with_flat_knobs() {
        let json = r#"{
            "generator_params": {"layers": 6, "stacks": 3, "aux_context_window": 2},
            "discriminator_params": {"layers": 5, "conv_channels": 16},
            "stft_loss_params": {
                "fft_sizes": [64, 128, 256],
                "hop_sizes": [32, 64, 128],
                "win_lengths": [48, 96, 192]
            },
            "generator_optimizer_params": {"lr": 0.0001, "eps": 1e-6, "weight_decay": 0.0},
            "lambda_adv": 2.5,
            "discriminator_train_start_steps": 100000
        }"#;
        let config = TrainingConfig::from_json_str(json).unwrap();
        assert_eq!(config.generator_params.layers, 6);
        assert_eq!(config.discriminator_params.conv_channels, 16);
        assert_eq!(config.generator_optimizer_params.betas, (0.9, 0.999));
        assert_eq!(config.train_step.lambda_adv, 2.5);
        assert_eq!(config.train_step.discriminator_train_start_steps, 100_000);
        assert_eq!(config.train_step.generator_grad_norm, 10.0);
    }

    #[test]
    fn test_invalid_block_is_config_error() {
        let json = r#"{"stft_loss_params": {"fft_sizes": [64], "hop_sizes": [32, 64], "win_lengths": [48]}}"#;
        assert!(TrainingConfig::from_json_str(json).unwrap_err().is_config());

        let json = r#"{"generator_optimizer_params": {"betas": [0.9, 1.5]}}"#;
        assert!(TrainingConfig::from_json_str(json).unwrap_err().is_config());
    }

    #[test]
    fn test_channel_mismatch() {
        let mut config = TrainingConfig::default();
        config.generator_params.out_channels = 2;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_file_round_trip() {
        let config = TrainingConfig::default();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json_string().unwrap().as_bytes()).unwrap();

        let loaded = TrainingConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = TrainingConfig::from_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, TrainerError::Io(_)));
    }
}

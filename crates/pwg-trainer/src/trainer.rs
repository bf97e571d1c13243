//! Adversarial training step.
//!
//! One step updates the generator on the multi-resolution STFT loss (plus the
//! weighted adversarial loss once the discriminator is active), then updates
//! the discriminator on real audio against a detached fake produced by the
//! freshly updated generator from the same noise.

use std::time::Instant;

use mlx_rs::error::Exception;
use mlx_rs::module::{FlattenedModuleParam, ModuleParameters};
use mlx_rs::nn;
use mlx_rs::optimizers::Optimizer;
use mlx_rs::transforms::eval_params;
use mlx_rs::Array;
use pwg_vocoder::{
    discriminator_adversarial_loss, generator_adversarial_loss, MultiResolutionStftLoss,
    ParallelWaveGanDiscriminator, ParallelWaveGanGenerator, RandomSource, StftLossConfig, VocoderError,
};

use crate::config::{TrainStepConfig, TrainingConfig};
use crate::error::{Result, TrainerError};
use crate::grad::{clip_by_global_norm, ensure_finite};
use crate::radam::RAdam;

/// One batch of training data.
#[derive(Debug, Clone)]
pub struct VocoderBatch {
    /// Target waveform [batch, out_channels, T].
    pub audio: Array,
    /// Conditioning [batch, aux_channels, T / hop + 2 * aux_context_window].
    pub conditioning: Array,
}

impl VocoderBatch {
    /// Bundle a waveform with its conditioning features.
    pub fn new(audio: Array, conditioning: Array) -> Self {
        Self { audio, conditioning }
    }

    /// Number of examples.
    pub fn batch_size(&self) -> i32 {
        self.audio.dim(0)
    }

    /// Waveform length in samples.
    pub fn samples(&self) -> i32 {
        self.audio.dim(-1)
    }
}

/// Statistics from one training step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepStats {
    /// Global step after this update (1-based).
    pub step: u64,
    /// Total generator loss.
    pub generator_loss: f32,
    /// Spectral convergence part of the generator loss.
    pub spectral_convergence_loss: f32,
    /// Log STFT magnitude part of the generator loss.
    pub log_stft_magnitude_loss: f32,
    /// Unweighted adversarial part, when the discriminator is active.
    pub adversarial_loss: Option<f32>,
    /// Discriminator loss (real + fake), when the discriminator was updated.
    pub discriminator_loss: Option<f32>,
    /// Generator gradient norm before clipping.
    pub generator_grad_norm: f32,
    /// Discriminator gradient norm before clipping.
    pub discriminator_grad_norm: Option<f32>,
    /// Wall time of the step.
    pub step_time_ms: u64,
}

/// Generator loss terms captured during the gradient pass.
struct GeneratorLossParts {
    sc: Array,
    mag: Array,
    adv: Option<Array>,
}

/// Runs adversarial training steps over a generator/discriminator pair.
///
/// The trainer owns everything that is not a model or an optimizer: the STFT
/// loss bank, the random source for noise and dropout, and the global step.
#[derive(Debug)]
pub struct VocoderTrainer {
    config: TrainStepConfig,
    stft_loss: MultiResolutionStftLoss,
    rng: RandomSource,
    step: u64,
}

impl VocoderTrainer {
    /// Create a trainer.
    pub fn new(config: TrainStepConfig, stft_loss_params: StftLossConfig) -> Result<Self> {
        config.validate()?;
        let stft_loss = MultiResolutionStftLoss::new(stft_loss_params)?;
        let rng = RandomSource::new(config.seed);
        Ok(Self {
            config,
            stft_loss,
            rng,
            step: 0,
        })
    }

    /// Training-step knobs.
    pub fn config(&self) -> &TrainStepConfig {
        &self.config
    }

    /// The auxiliary spectral loss.
    pub fn stft_loss(&self) -> &MultiResolutionStftLoss {
        &self.stft_loss
    }

    /// Completed steps.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Resume the step counter (e.g. after an external checkpoint load).
    pub fn set_step(&mut self, step: u64) {
        self.step = step;
    }

    /// Whether the adversarial terms and the discriminator update run at the
    /// current step.
    pub fn discriminator_active(&self) -> bool {
        self.step >= self.config.discriminator_train_start_steps
    }

    /// Run one generator update followed by one discriminator update.
    ///
    /// A non-finite loss or gradient norm aborts the step with
    /// [`TrainerError::NonFinite`]. A failed step leaves both models, both
    /// optimizers and the step counter as they were: a discriminator-phase
    /// failure rolls back the generator update.
    pub fn train_step<GO, DO>(
        &mut self,
        generator: &mut ParallelWaveGanGenerator,
        discriminator: &mut ParallelWaveGanDiscriminator,
        generator_optimizer: &mut GO,
        discriminator_optimizer: &mut DO,
        batch: &VocoderBatch,
    ) -> Result<StepStats>
    where
        GO: Optimizer + Clone,
        DO: Optimizer,
    {
        let start_time = Instant::now();
        let step = self.step + 1;
        let adversarial = self.discriminator_active();

        let y = &batch.audio;
        let c = &batch.conditioning;
        let g_config = &generator.config;
        if y.ndim() != 3 || c.ndim() != 3 {
            return Err(VocoderError::Shape(format!(
                "audio and conditioning must be (batch, channels, time), got {:?} and {:?}",
                y.shape(),
                c.shape()
            ))
            .into());
        }
        if y.dim(1) != g_config.out_channels {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![y.dim(0), g_config.out_channels, y.dim(2)],
                actual: y.shape().to_vec(),
            }
            .into());
        }
        if c.dim(0) != y.dim(0) || c.dim(1) != g_config.aux_channels {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![y.dim(0), g_config.aux_channels, c.dim(2)],
                actual: c.shape().to_vec(),
            }
            .into());
        }
        let expected_frames = generator.conditioning_frames(y.dim(2))?;
        if c.dim(2) != expected_frames {
            return Err(TrainerError::Config(format!(
                "{} samples need {expected_frames} conditioning frames, got {}",
                y.dim(2),
                c.dim(2)
            )));
        }
        let z = self
            .rng
            .normal(&[y.dim(0), g_config.in_channels, y.dim(2)])?;

        // Generator phase
        let lambda_adv = self.config.lambda_adv;
        let mut parts: Option<GeneratorLossParts> = None;
        let (g_loss, mut g_grads) = {
            let stft_loss = &self.stft_loss;
            let rng = &mut self.rng;
            let critic: &ParallelWaveGanDiscriminator = discriminator;
            let parts = &mut parts;

            let loss_fn = move |model: &mut ParallelWaveGanGenerator,
                                (z, c): (&Array, &Array)|
                  -> std::result::Result<Array, Exception> {
                let y_hat = model
                    .forward_train(z, c, rng)
                    .map_err(|e| Exception::custom(e.to_string()))?;
                let (sc, mag) = stft_loss
                    .forward(&y_hat, y)
                    .map_err(|e| Exception::custom(e.to_string()))?;
                let mut loss = sc.add(&mag)?;

                let adv = if adversarial {
                    let scores = critic
                        .forward(&y_hat)
                        .map_err(|e| Exception::custom(e.to_string()))?;
                    let adv = generator_adversarial_loss(&scores).map_err(|e| Exception::custom(e.to_string()))?;
                    loss = loss.add(&adv.multiply(&Array::from_f32(lambda_adv))?)?;
                    Some(adv)
                } else {
                    None
                };

                *parts = Some(GeneratorLossParts { sc, mag, adv });
                Ok(loss)
            };

            let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
            loss_and_grad_fn(generator, (&z, c))?
        };

        g_loss.eval()?;
        let generator_loss = g_loss.item::<f32>();
        ensure_finite(generator_loss, "generator loss", step)?;

        let generator_grad_norm = clip_by_global_norm(&mut g_grads, self.config.generator_grad_norm)?;
        ensure_finite(generator_grad_norm, "generator gradient norm", step)?;
        warn_if_clipped("generator", step, generator_grad_norm, self.config.generator_grad_norm);

        let generator_snapshot: FlattenedModuleParam = generator
            .parameters()
            .flatten()
            .into_iter()
            .map(|(k, v)| (k, v.clone()))
            .collect();
        let generator_optimizer_snapshot = generator_optimizer.clone();
        let rng_snapshot = self.rng.clone();

        generator_optimizer.update(generator, g_grads)?;
        eval_params(generator.parameters())?;

        let parts = parts.ok_or_else(|| TrainerError::Config("generator loss was not evaluated".into()))?;
        let spectral_convergence_loss = scalar(&parts.sc)?;
        let log_stft_magnitude_loss = scalar(&parts.mag)?;
        let adversarial_loss = parts.adv.as_ref().map(scalar).transpose()?;

        // Discriminator phase
        let discriminator_phase = if adversarial {
            self.discriminator_step(generator, discriminator, discriminator_optimizer, &z, batch, step)
                .map(Some)
        } else {
            Ok(None)
        };
        let (discriminator_loss, discriminator_grad_norm) = match discriminator_phase {
            Ok(Some((loss, norm))) => (Some(loss), Some(norm)),
            Ok(None) => (None, None),
            Err(e) => {
                {
                    let mut params = generator.parameters_mut().flatten();
                    for (key, value) in generator_snapshot {
                        if let Some(param) = params.get_mut(&key) {
                            **param = value;
                        }
                    }
                }
                eval_params(generator.parameters())?;
                *generator_optimizer = generator_optimizer_snapshot;
                self.rng = rng_snapshot;
                tracing::warn!(step, error = %e, "discriminator phase failed, generator update rolled back");
                return Err(e);
            }
        };

        self.step = step;
        let stats = StepStats {
            step,
            generator_loss,
            spectral_convergence_loss,
            log_stft_magnitude_loss,
            adversarial_loss,
            discriminator_loss,
            generator_grad_norm,
            discriminator_grad_norm,
            step_time_ms: start_time.elapsed().as_millis() as u64,
        };

        let interval = self.config.log_interval_steps;
        if interval > 0 && step % interval == 0 {
            tracing::info!(
                step,
                generator_loss,
                spectral_convergence_loss,
                log_stft_magnitude_loss,
                adversarial_loss = ?adversarial_loss,
                discriminator_loss = ?discriminator_loss,
                generator_grad_norm,
                discriminator_grad_norm = ?discriminator_grad_norm,
                step_time_ms = stats.step_time_ms,
                "training step"
            );
        }
        Ok(stats)
    }

    /// Update the discriminator on real audio against a detached fake
    /// regenerated from `z`. Returns (loss, pre-clip gradient norm).
    ///
    /// Fails before touching the discriminator when either is non-finite.
    fn discriminator_step<DO: Optimizer>(
        &mut self,
        generator: &ParallelWaveGanGenerator,
        discriminator: &mut ParallelWaveGanDiscriminator,
        discriminator_optimizer: &mut DO,
        z: &Array,
        batch: &VocoderBatch,
        step: u64,
    ) -> Result<(f32, f32)> {
        let fake = mlx_rs::stop_gradient(&generator.forward_train(z, &batch.conditioning, &mut self.rng)?)?;

        let loss_fn = |model: &mut ParallelWaveGanDiscriminator,
                       (real, fake): (&Array, &Array)|
         -> std::result::Result<Array, Exception> {
            let real_scores = model.forward(real).map_err(|e| Exception::custom(e.to_string()))?;
            let fake_scores = model.forward(fake).map_err(|e| Exception::custom(e.to_string()))?;
            let (real_loss, fake_loss) = discriminator_adversarial_loss(&real_scores, &fake_scores)
                .map_err(|e| Exception::custom(e.to_string()))?;
            real_loss.add(&fake_loss)
        };

        let mut loss_and_grad_fn = nn::value_and_grad(loss_fn);
        let (d_loss, mut d_grads) = loss_and_grad_fn(discriminator, (&batch.audio, &fake))?;

        d_loss.eval()?;
        let d_loss = d_loss.item::<f32>();
        ensure_finite(d_loss, "discriminator loss", step)?;

        let d_norm = clip_by_global_norm(&mut d_grads, self.config.discriminator_grad_norm)?;
        ensure_finite(d_norm, "discriminator gradient norm", step)?;
        warn_if_clipped("discriminator", step, d_norm, self.config.discriminator_grad_norm);

        discriminator_optimizer.update(discriminator, d_grads)?;
        eval_params(discriminator.parameters())?;
        Ok((d_loss, d_norm))
    }
}

/// Models and optimizers built from one [`TrainingConfig`].
#[derive(Debug)]
pub struct TrainingSession {
    /// Step driver.
    pub trainer: VocoderTrainer,
    /// Generator being trained.
    pub generator: ParallelWaveGanGenerator,
    /// Discriminator being trained.
    pub discriminator: ParallelWaveGanDiscriminator,
    /// Generator optimizer.
    pub generator_optimizer: RAdam,
    /// Discriminator optimizer.
    pub discriminator_optimizer: RAdam,
}

impl TrainingSession {
    /// Validate `config` and build every component.
    pub fn new(config: &TrainingConfig) -> Result<Self> {
        config.validate()?;
        let session = Self {
            trainer: VocoderTrainer::new(config.train_step.clone(), config.stft_loss_params.clone())?,
            generator: ParallelWaveGanGenerator::new(config.generator_params.clone())?,
            discriminator: ParallelWaveGanDiscriminator::new(config.discriminator_params.clone())?,
            generator_optimizer: RAdam::new(config.generator_optimizer_params.clone())?,
            discriminator_optimizer: RAdam::new(config.discriminator_optimizer_params.clone())?,
        };
        tracing::info!(
            generator_parameters = session.generator.num_parameters(),
            discriminator_parameters = session.discriminator.num_parameters(),
            receptive_field = session.generator.receptive_field_size(),
            discriminator_train_start_steps = config.train_step.discriminator_train_start_steps,
            "training session ready"
        );
        Ok(session)
    }

    /// Run one training step on `batch`.
    pub fn train_step(&mut self, batch: &VocoderBatch) -> Result<StepStats> {
        self.trainer.train_step(
            &mut self.generator,
            &mut self.discriminator,
            &mut self.generator_optimizer,
            &mut self.discriminator_optimizer,
            batch,
        )
    }
}

fn scalar(x: &Array) -> Result<f32> {
    x.eval()?;
    Ok(x.item::<f32>())
}

fn warn_if_clipped(model: &str, step: u64, norm: f32, max_norm: f32) {
    if max_norm > 0.0 && norm > max_norm {
        tracing::warn!(model, step, grad_norm = norm, max_norm, "clipping gradients");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pwg_vocoder::{DiscriminatorConfig, GeneratorConfig, UpsampleParams};

    fn tiny_config() -> TrainingConfig {
        TrainingConfig {
            generator_params: GeneratorConfig {
                layers: 3,
                stacks: 1,
                residual_channels: 4,
                gate_channels: 8,
                skip_channels: 4,
                aux_channels: 6,
                aux_context_window: 0,
                upsample_params: UpsampleParams::with_scales(vec![4]),
                ..GeneratorConfig::default()
            },
            discriminator_params: DiscriminatorConfig {
                layers: 3,
                conv_channels: 4,
                ..DiscriminatorConfig::default()
            },
            stft_loss_params: StftLossConfig {
                fft_sizes: vec![32, 64],
                hop_sizes: vec![8, 16],
                win_lengths: vec![32, 48],
                window: "hann_window".into(),
            },
            ..TrainingConfig::default()
        }
    }

    fn batch(samples: i32, frames: i32) -> VocoderBatch {
        let mut rng = RandomSource::new(7);
        let audio = rng.uniform(-0.5, 0.5, &[2, 1, samples]).unwrap();
        let conditioning = rng.normal(&[2, 6, frames]).unwrap();
        VocoderBatch::new(audio, conditioning)
    }

    fn update_counts(session: &TrainingSession) -> Vec<u64> {
        session
            .discriminator
            .parameters()
            .flatten()
            .keys()
            .map(|key| session.discriminator_optimizer.step_count(key))
            .collect()
    }

    #[test]
    fn test_step_counter_and_stats() {
        let mut session = TrainingSession::new(&tiny_config()).unwrap();
        let stats = session.train_step(&batch(256, 64)).unwrap();
        assert_eq!(stats.step, 1);
        assert_eq!(session.trainer.step(), 1);
        assert!(stats.generator_loss.is_finite());
        assert!(stats.adversarial_loss.is_some());
        assert!(stats.discriminator_loss.is_some());
        let expected = stats.spectral_convergence_loss
            + stats.log_stft_magnitude_loss
            + 4.0 * stats.adversarial_loss.unwrap();
        assert!((stats.generator_loss - expected).abs() < 1e-3 * expected.max(1.0));
    }

    #[test]
    fn test_discriminator_waits_for_start_step() {
        let mut config = tiny_config();
        config.train_step.discriminator_train_start_steps = 2;
        let mut session = TrainingSession::new(&config).unwrap();
        let b = batch(256, 64);

        for _ in 0..2 {
            let stats = session.train_step(&b).unwrap();
            assert!(stats.adversarial_loss.is_none());
            assert!(stats.discriminator_loss.is_none());
            assert!(stats.discriminator_grad_norm.is_none());
            assert!((stats.generator_loss - stats.spectral_convergence_loss - stats.log_stft_magnitude_loss).abs() < 1e-4);
        }
        assert!(update_counts(&session).iter().all(|&n| n == 0));

        let stats = session.train_step(&b).unwrap();
        assert!(stats.discriminator_loss.is_some());
        assert!(update_counts(&session).iter().all(|&n| n == 1));
    }

    #[test]
    fn test_failed_step_does_not_advance() {
        let mut session = TrainingSession::new(&tiny_config()).unwrap();
        // Conditioning covers 60 * 4 = 240 samples, not 256.
        let err = session.train_step(&batch(256, 60)).unwrap_err();
        assert!(err.is_config());
        assert_eq!(session.trainer.step(), 0);
    }

    #[test]
    fn test_rank_two_audio_is_shape_error() {
        let mut session = TrainingSession::new(&tiny_config()).unwrap();
        let b = batch(256, 64);
        let flat = VocoderBatch::new(b.audio.reshape(&[2, 256]).unwrap(), b.conditioning);
        assert!(session.train_step(&flat).unwrap_err().is_shape());
    }
}

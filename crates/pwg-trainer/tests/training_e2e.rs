//! End-to-end trainability tests.
//!
//! Every case builds a generator, a discriminator and the STFT loss, runs one
//! adversarial training step on random data and checks that every parameter
//! of both models moved.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::module::ModuleParameters;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use pwg_trainer::{
    RAdam, RAdamConfig, TrainStepConfig, TrainingConfig, TrainingSession, VocoderBatch, VocoderTrainer,
};
use pwg_vocoder::nn::ActivationParams;
use pwg_vocoder::{
    DiscriminatorConfig, GeneratorConfig, ParallelWaveGanDiscriminator, ParallelWaveGanGenerator, RandomSource,
    StftLossConfig, UpsampleNetKind, UpsampleParams,
};

const BATCH_SIZE: i32 = 4;
const BATCH_LENGTH: i32 = 4096;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn generator_config() -> GeneratorConfig {
    GeneratorConfig {
        in_channels: 1,
        out_channels: 1,
        kernel_size: 3,
        layers: 6,
        stacks: 3,
        residual_channels: 8,
        gate_channels: 16,
        skip_channels: 8,
        aux_channels: 10,
        aux_context_window: 0,
        dropout: 1.0 - 0.95,
        use_weight_norm: true,
        use_causal_conv: false,
        upsample_conditional_features: true,
        upsample_net: UpsampleNetKind::ConvInUpsampleNetwork,
        upsample_params: UpsampleParams::with_scales(vec![4, 4]),
        ..GeneratorConfig::default()
    }
}

fn discriminator_config() -> DiscriminatorConfig {
    DiscriminatorConfig {
        in_channels: 1,
        out_channels: 1,
        kernel_size: 3,
        layers: 5,
        conv_channels: 16,
        nonlinear_activation: "LeakyReLU".into(),
        nonlinear_activation_params: ActivationParams::negative_slope(0.2),
        bias: true,
        use_weight_norm: true,
        ..DiscriminatorConfig::default()
    }
}

fn stft_loss_config() -> StftLossConfig {
    StftLossConfig {
        fft_sizes: vec![64, 128, 256],
        hop_sizes: vec![32, 64, 128],
        win_lengths: vec![48, 96, 192],
        window: "hann_window".into(),
    }
}

/// Step knobs matching a bare one-step update: equal loss weights, no
/// clipping, discriminator active from the first step.
fn step_config() -> TrainStepConfig {
    TrainStepConfig {
        lambda_adv: 1.0,
        discriminator_train_start_steps: 0,
        generator_grad_norm: 0.0,
        discriminator_grad_norm: 0.0,
        seed: 1,
        log_interval_steps: 1,
    }
}

fn random_batch(config: &GeneratorConfig, seed: u64) -> VocoderBatch {
    let frames = BATCH_LENGTH / config.hop_size() + 2 * config.aux_context_window;
    let mut rng = RandomSource::new(seed);
    let audio = rng.normal(&[BATCH_SIZE, 1, BATCH_LENGTH]).unwrap();
    let conditioning = rng.normal(&[BATCH_SIZE, config.aux_channels, frames]).unwrap();
    VocoderBatch::new(audio, conditioning)
}

fn snapshot(model: &impl ModuleParameters) -> HashMap<Rc<str>, Array> {
    model
        .parameters()
        .flatten()
        .into_iter()
        .map(|(key, value)| (key, value.clone()))
        .collect()
}

fn max_abs_diff(a: &Array, b: &Array) -> f32 {
    let diff = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
    diff.eval().unwrap();
    diff.item::<f32>()
}

/// Keys of parameters whose value did not change.
fn unchanged(before: &HashMap<Rc<str>, Array>, model: &impl ModuleParameters) -> Vec<String> {
    let after = snapshot(model);
    assert_eq!(before.len(), after.len());
    let mut keys: Vec<String> = before
        .iter()
        .filter(|(key, value)| max_abs_diff(value, &after[*key]) == 0.0)
        .map(|(key, _)| key.to_string())
        .collect();
    keys.sort();
    keys
}

fn assert_trainable(generator_params: GeneratorConfig, discriminator_params: DiscriminatorConfig) {
    init_tracing();
    let config = TrainingConfig {
        generator_params,
        discriminator_params,
        stft_loss_params: stft_loss_config(),
        generator_optimizer_params: RAdamConfig::default(),
        discriminator_optimizer_params: RAdamConfig::default(),
        train_step: step_config(),
    };
    let mut session = TrainingSession::new(&config).unwrap();
    let batch = random_batch(&config.generator_params, 42);

    let g_before = snapshot(&session.generator);
    let d_before = snapshot(&session.discriminator);

    let stats = session.train_step(&batch).unwrap();
    assert_eq!(stats.step, 1);
    assert!(stats.generator_loss.is_finite());
    assert!(stats.discriminator_loss.is_some_and(f32::is_finite));

    let frozen = unchanged(&g_before, &session.generator);
    assert!(frozen.is_empty(), "generator parameters did not change: {frozen:?}");
    let frozen = unchanged(&d_before, &session.discriminator);
    assert!(frozen.is_empty(), "discriminator parameters did not change: {frozen:?}");
}

#[test]
fn test_trainable_default() {
    assert_trainable(generator_config(), discriminator_config());
}

#[test]
fn test_trainable_single_layer_generator() {
    assert_trainable(
        GeneratorConfig {
            layers: 1,
            stacks: 1,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_single_layer_discriminator() {
    assert_trainable(
        generator_config(),
        DiscriminatorConfig {
            layers: 1,
            ..discriminator_config()
        },
    );
}

#[test]
fn test_trainable_generator_kernel_5() {
    assert_trainable(
        GeneratorConfig {
            kernel_size: 5,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_discriminator_kernel_5() {
    assert_trainable(
        generator_config(),
        DiscriminatorConfig {
            kernel_size: 5,
            ..discriminator_config()
        },
    );
}

#[test]
fn test_trainable_narrow_gate() {
    assert_trainable(
        GeneratorConfig {
            gate_channels: 8,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_single_stack() {
    assert_trainable(
        GeneratorConfig {
            stacks: 1,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_without_weight_norm() {
    assert_trainable(
        GeneratorConfig {
            use_weight_norm: false,
            ..generator_config()
        },
        DiscriminatorConfig {
            use_weight_norm: false,
            ..discriminator_config()
        },
    );
}

#[test]
fn test_trainable_with_context_window() {
    assert_trainable(
        GeneratorConfig {
            aux_context_window: 2,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_plain_upsample_network() {
    assert_trainable(
        GeneratorConfig {
            upsample_net: UpsampleNetKind::UpsampleNetwork,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_single_scale_wide_freq_kernel() {
    assert_trainable(
        GeneratorConfig {
            upsample_params: UpsampleParams {
                freq_axis_kernel_size: 3,
                ..UpsampleParams::with_scales(vec![4])
            },
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_sample_rate_conditioning() {
    assert_trainable(
        GeneratorConfig {
            upsample_conditional_features: false,
            upsample_params: UpsampleParams::with_scales(vec![1]),
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_relu_discriminator() {
    assert_trainable(
        generator_config(),
        DiscriminatorConfig {
            nonlinear_activation: "ReLU".into(),
            nonlinear_activation_params: ActivationParams::default(),
            ..discriminator_config()
        },
    );
}

#[test]
fn test_trainable_causal() {
    assert_trainable(
        GeneratorConfig {
            use_causal_conv: true,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_causal_context_1() {
    assert_trainable(
        GeneratorConfig {
            use_causal_conv: true,
            aux_context_window: 1,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_causal_context_2() {
    assert_trainable(
        GeneratorConfig {
            use_causal_conv: true,
            aux_context_window: 2,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_trainable_causal_context_3() {
    assert_trainable(
        GeneratorConfig {
            use_causal_conv: true,
            aux_context_window: 3,
            ..generator_config()
        },
        discriminator_config(),
    );
}

#[test]
fn test_non_finite_batch_leaves_parameters_untouched() {
    init_tracing();
    let g_config = generator_config();
    let mut generator = ParallelWaveGanGenerator::new(g_config.clone()).unwrap();
    let mut discriminator = ParallelWaveGanDiscriminator::new(discriminator_config()).unwrap();
    let mut g_opt = RAdam::new(RAdamConfig::default()).unwrap();
    let mut d_opt = RAdam::new(RAdamConfig::default()).unwrap();
    let mut trainer = VocoderTrainer::new(step_config(), stft_loss_config()).unwrap();

    let batch = random_batch(&g_config, 3);
    let poisoned = VocoderBatch::new(
        batch.audio.multiply(&Array::from_f32(f32::NAN)).unwrap(),
        batch.conditioning.clone(),
    );

    let g_before = snapshot(&generator);
    let d_before = snapshot(&discriminator);

    let err = trainer
        .train_step(&mut generator, &mut discriminator, &mut g_opt, &mut d_opt, &poisoned)
        .unwrap_err();
    assert!(err.is_non_finite(), "unexpected error: {err}");
    assert_eq!(trainer.step(), 0);

    assert_eq!(unchanged(&g_before, &generator).len(), g_before.len());
    assert_eq!(unchanged(&d_before, &discriminator).len(), d_before.len());

    // A clean batch still trains afterwards.
    let stats = trainer
        .train_step(&mut generator, &mut discriminator, &mut g_opt, &mut d_opt, &batch)
        .unwrap();
    assert_eq!(stats.step, 1);
}

#[test]
fn test_discriminator_failure_rolls_back_generator() {
    init_tracing();
    let g_config = generator_config();
    let mut generator = ParallelWaveGanGenerator::new(g_config.clone()).unwrap();
    let mut discriminator = ParallelWaveGanDiscriminator::new(discriminator_config()).unwrap();
    let mut g_opt = RAdam::new(RAdamConfig::default()).unwrap();
    let mut d_opt = RAdam::new(RAdamConfig::default()).unwrap();
    // Without the adversarial term the generator phase only sees the
    // scale-invariant STFT loss, so it stays finite while the discriminator
    // gradients on the real audio overflow.
    let mut trainer = VocoderTrainer::new(
        TrainStepConfig {
            lambda_adv: 0.0,
            ..step_config()
        },
        stft_loss_config(),
    )
    .unwrap();
    assert!(trainer.discriminator_active());

    let batch = random_batch(&g_config, 5);
    let loud = VocoderBatch::new(
        batch.audio.multiply(&Array::from_f32(1e14)).unwrap(),
        batch.conditioning.clone(),
    );

    let g_before = snapshot(&generator);
    let d_before = snapshot(&discriminator);

    let err = trainer
        .train_step(&mut generator, &mut discriminator, &mut g_opt, &mut d_opt, &loud)
        .unwrap_err();
    assert!(err.is_non_finite(), "unexpected error: {err}");
    assert_eq!(trainer.step(), 0);

    assert_eq!(unchanged(&g_before, &generator).len(), g_before.len());
    assert_eq!(unchanged(&d_before, &discriminator).len(), d_before.len());
    for key in g_before.keys() {
        assert_eq!(g_opt.step_count(key), 0, "generator optimizer advanced for {key}");
        assert!(g_opt.moments(key).is_none());
    }
    for key in d_before.keys() {
        assert_eq!(d_opt.step_count(key), 0, "discriminator optimizer advanced for {key}");
    }

    // The next clean step is the first one both optimizers see.
    let stats = trainer
        .train_step(&mut generator, &mut discriminator, &mut g_opt, &mut d_opt, &batch)
        .unwrap();
    assert_eq!(stats.step, 1);
    assert!(g_before.keys().all(|key| g_opt.step_count(key) == 1));
    assert!(d_before.keys().all(|key| d_opt.step_count(key) == 1));
}

#[test]
fn test_invalid_configurations_are_rejected() {
    let cases = [
        GeneratorConfig {
            layers: 5,
            stacks: 3,
            ..generator_config()
        },
        GeneratorConfig {
            gate_channels: 15,
            ..generator_config()
        },
        GeneratorConfig {
            kernel_size: 4,
            ..generator_config()
        },
        GeneratorConfig {
            upsample_net: UpsampleNetKind::UpsampleNetwork,
            aux_context_window: 2,
            ..generator_config()
        },
    ];
    for generator_params in cases {
        let config = TrainingConfig {
            generator_params,
            discriminator_params: discriminator_config(),
            stft_loss_params: stft_loss_config(),
            ..TrainingConfig::default()
        };
        let err = TrainingSession::new(&config).unwrap_err();
        assert!(err.is_config(), "unexpected error: {err}");
    }

    let config = TrainingConfig {
        discriminator_params: DiscriminatorConfig {
            kernel_size: 4,
            ..discriminator_config()
        },
        ..TrainingConfig::default()
    };
    assert!(TrainingSession::new(&config).unwrap_err().is_config());
}

#[test]
fn test_mismatched_conditioning_length() {
    let config = TrainingConfig {
        generator_params: generator_config(),
        discriminator_params: discriminator_config(),
        stft_loss_params: stft_loss_config(),
        train_step: step_config(),
        ..TrainingConfig::default()
    };
    let mut session = TrainingSession::new(&config).unwrap();
    let batch = random_batch(&config.generator_params, 5);
    let short = VocoderBatch::new(batch.audio.clone(), batch.conditioning.index((.., .., ..200)));
    assert!(session.train_step(&short).unwrap_err().is_config());
}


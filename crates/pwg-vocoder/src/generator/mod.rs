//! Parallel WaveGAN generator.
//!
//! A non-autoregressive WaveNet: Gaussian noise is pushed through a stack of
//! dilated gated residual blocks, each conditioned on the upsampled acoustic
//! features, and the summed skip connections are projected to a waveform of
//! the same length as the noise.

use crate::audio::{pad_time, PadMode};
use crate::config::GeneratorConfig;
use crate::error::{expect_ncl, Result, VocoderError};
use crate::nn::{Conv1d, ConvWeight, ResidualBlock, ResidualBlockConfig};
use crate::random::RandomSource;
use crate::upsample::UpsampleNetwork;
use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::ModuleParameters as _;
use mlx_rs::Array;

/// Parallel WaveGAN generator.
///
/// Converts noise [batch, in_channels, T] and conditioning
/// [batch, aux_channels, T / hop + 2 * aux_context_window] to a waveform
/// [batch, out_channels, T].
#[derive(Debug, ModuleParameters)]
pub struct ParallelWaveGanGenerator {
    /// Model configuration.
    pub config: GeneratorConfig,
    /// Pointwise projection of the noise into the residual stream.
    #[param]
    pub first_conv: Conv1d,
    /// Conditioning upsampler; absent when the conditioning is already
    /// sample-rate.
    #[param]
    pub upsample_net: Option<UpsampleNetwork>,
    /// Residual blocks.
    #[param]
    pub conv_layers: Vec<ResidualBlock>,
    /// Skip -> skip projection after the first ReLU.
    #[param]
    pub last_conv_1: Conv1d,
    /// Skip -> output projection after the second ReLU.
    #[param]
    pub last_conv_2: Conv1d,
}

impl ParallelWaveGanGenerator {
    /// Create a new generator from configuration.
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        config.validate()?;
        let wn = config.use_weight_norm;

        let upsample_net = if config.upsample_conditional_features {
            Some(UpsampleNetwork::new(
                config.upsample_net,
                &config.upsample_params,
                config.aux_channels,
                config.aux_context_window,
                config.use_causal_conv,
                wn,
            )?)
        } else {
            None
        };

        let conv_layers = config
            .dilations()
            .into_iter()
            .map(|dilation| {
                ResidualBlock::new(&ResidualBlockConfig {
                    kernel_size: config.kernel_size,
                    residual_channels: config.residual_channels,
                    gate_channels: config.gate_channels,
                    skip_channels: config.skip_channels,
                    aux_channels: config.aux_channels,
                    dilation,
                    dropout: config.dropout,
                    bias: config.bias,
                    causal: config.use_causal_conv,
                    use_weight_norm: wn,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let model = Self {
            first_conv: Conv1d::pointwise(config.in_channels, config.residual_channels, true, wn)?,
            upsample_net,
            conv_layers,
            last_conv_1: Conv1d::pointwise(config.skip_channels, config.skip_channels, true, wn)?,
            last_conv_2: Conv1d::pointwise(config.skip_channels, config.out_channels, true, wn)?,
            config,
        };

        tracing::debug!(
            layers = model.config.layers,
            stacks = model.config.stacks,
            receptive_field = model.receptive_field_size(),
            hop_size = model.config.hop_size(),
            parameters = model.num_parameters(),
            causal = model.config.use_causal_conv,
            "built Parallel WaveGAN generator"
        );
        Ok(model)
    }

    /// Samples of input that can influence one output sample.
    pub fn receptive_field_size(&self) -> i32 {
        let dilation_sum: i32 = self.config.dilations().iter().sum();
        (self.config.kernel_size - 1) * dilation_sum + 1
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.parameters().flatten().values().map(|p| p.size()).sum()
    }

    /// Conditioning frames the generator expects for `samples` output samples.
    pub fn conditioning_frames(&self, samples: i32) -> Result<i32> {
        let hop = self.config.hop_size();
        if samples <= 0 || samples % hop != 0 {
            return Err(VocoderError::Config(format!(
                "waveform length {samples} is not a positive multiple of the hop size {hop}"
            )));
        }
        let context = self.upsample_net.as_ref().map_or(0, |u| u.context_frames());
        Ok(samples / hop + context)
    }

    /// Inference forward pass (no dropout).
    ///
    /// # Arguments
    /// * `z` - Noise [batch, in_channels, T]
    /// * `c` - Conditioning [batch, aux_channels, T / hop + 2 * aux_context_window]
    ///
    /// # Returns
    /// Waveform [batch, out_channels, T]
    pub fn forward(&self, z: &Array, c: &Array) -> Result<Array> {
        self.forward_inner(z, c, None)
    }

    /// Training forward pass with dropout drawn from `rng`.
    pub fn forward_train(&self, z: &Array, c: &Array, rng: &mut RandomSource) -> Result<Array> {
        self.forward_inner(z, c, Some(rng))
    }

    fn forward_inner(&self, z: &Array, c: &Array, mut rng: Option<&mut RandomSource>) -> Result<Array> {
        expect_ncl(z, self.config.in_channels, "noise")?;
        let c = match &self.upsample_net {
            Some(upsample) => upsample.forward(c)?,
            None => {
                expect_ncl(c, self.config.aux_channels, "conditioning")?;
                c.clone()
            }
        };
        if c.dim(0) != z.dim(0) {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![z.dim(0), self.config.aux_channels, c.dim(2)],
                actual: c.shape().to_vec(),
            });
        }
        if c.dim(2) != z.dim(2) {
            return Err(VocoderError::Config(format!(
                "conditioning covers {} samples after upsampling but the noise has {}",
                c.dim(2),
                z.dim(2)
            )));
        }

        let mut x = self.first_conv.forward(z)?;
        let mut skips: Option<Array> = None;
        for layer in &self.conv_layers {
            let (out, skip) = layer.forward(&x, &c, rng.as_deref_mut())?;
            x = out;
            skips = Some(match skips {
                Some(acc) => acc.add(&skip)?,
                None => skip,
            });
        }
        let skips = skips.ok_or_else(|| VocoderError::Config("generator has no layers".into()))?;
        let scale = Array::from_f32((1.0 / self.conv_layers.len() as f32).sqrt());
        let x = skips.multiply(&scale)?;

        let x = mlx_rs::nn::relu(&x)?;
        let x = self.last_conv_1.forward(&x)?;
        let x = mlx_rs::nn::relu(&x)?;
        self.last_conv_2.forward(&x)
    }

    /// Synthesize a waveform from conditioning alone.
    ///
    /// Replicate-pads the conditioning by `aux_context_window` frames on
    /// each side, draws the noise from `rng` and runs the inference pass.
    ///
    /// # Arguments
    /// * `c` - Conditioning [aux_channels, frames] or [batch, aux_channels, frames]
    ///
    /// # Returns
    /// Waveform [batch, frames * hop] (or [batch, out_channels, frames * hop]
    /// for multi-channel output)
    pub fn generate(&self, c: &Array, rng: &mut RandomSource) -> Result<Array> {
        let c = match c.ndim() {
            2 => c.reshape(&[1, c.dim(0), c.dim(1)])?,
            3 => c.clone(),
            n => {
                return Err(VocoderError::Shape(format!(
                    "conditioning must have rank 2 or 3, got {n}"
                )))
            }
        };
        expect_ncl(&c, self.config.aux_channels, "conditioning")?;

        let context = self.upsample_net.as_ref().map_or(0, |u| u.context_frames() / 2);
        let c = if context > 0 {
            pad_time(&c, context, context, PadMode::Replicate)?
        } else {
            c
        };

        let batch = c.dim(0);
        let samples = (c.dim(2) - 2 * context) * self.config.hop_size();
        let z = rng.normal(&[batch, self.config.in_channels, samples])?;
        let y = self.forward(&z, &c)?;

        if self.config.out_channels == 1 {
            Ok(y.reshape(&[batch, samples])?)
        } else {
            Ok(y)
        }
    }

    /// Every convolution kernel in the model.
    fn conv_weights_mut(&mut self) -> Vec<&mut ConvWeight> {
        let mut weights = vec![&mut self.first_conv.kernel];
        if let Some(upsample) = self.upsample_net.as_mut() {
            weights.extend(upsample.conv_weights_mut());
        }
        for layer in self.conv_layers.iter_mut() {
            weights.extend(layer.convs_mut().into_iter().map(|conv| &mut conv.kernel));
        }
        weights.push(&mut self.last_conv_1.kernel);
        weights.push(&mut self.last_conv_2.kernel);
        weights
    }

    /// Fuse every weight-normalized kernel into a plain kernel.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        let mut fused = 0;
        for weight in self.conv_weights_mut() {
            if weight.is_weight_normalized() {
                weight.remove_weight_norm()?;
                fused += 1;
            }
        }
        tracing::debug!(fused, "removed weight normalization from generator");
        Ok(())
    }

    /// Decompose every plain kernel into direction and magnitude.
    pub fn apply_weight_norm(&mut self) -> Result<()> {
        for weight in self.conv_weights_mut() {
            weight.apply_weight_norm()?;
        }
        Ok(())
    }

    /// Whether the kernels are currently weight-normalized.
    pub fn is_weight_normalized(&self) -> bool {
        self.first_conv.kernel.is_weight_normalized()
    }
}

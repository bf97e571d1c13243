//! Parallel WaveGAN component configuration.
//!
//! Field names and defaults follow the published Parallel WaveGAN recipes so
//! that existing YAML/JSON configurations deserialize unchanged. Every config
//! exposes `validate()`, which rejects inconsistent combinations before any
//! tensor is allocated.

use crate::audio::WindowKind;
use crate::error::{Result, VocoderError};
use crate::nn::{Activation, ActivationParams};
use serde::{Deserialize, Serialize};

/// Which conditioning upsampler the generator builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum UpsampleNetKind {
    /// Stretch + smoothing stages only.
    UpsampleNetwork,
    /// A context-consuming input convolution followed by the stretch stages.
    #[default]
    ConvInUpsampleNetwork,
}

/// Parameters of the conditioning upsampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsampleParams {
    /// Per-stage upsampling factors. Their product is the hop size.
    #[serde(default = "default_upsample_scales")]
    pub upsample_scales: Vec<i32>,

    /// Kernel size of the smoothing convolution along the channel axis.
    #[serde(default = "default_freq_axis_kernel_size")]
    pub freq_axis_kernel_size: i32,

    /// Optional nonlinearity applied after each smoothing convolution.
    #[serde(default)]
    pub nonlinear_activation: Option<String>,

    /// Parameters of `nonlinear_activation`.
    #[serde(default)]
    pub nonlinear_activation_params: ActivationParams,
}

impl Default for UpsampleParams {
    fn default() -> Self {
        Self {
            upsample_scales: default_upsample_scales(),
            freq_axis_kernel_size: default_freq_axis_kernel_size(),
            nonlinear_activation: None,
            nonlinear_activation_params: ActivationParams::default(),
        }
    }
}

impl UpsampleParams {
    /// Params with the given scales and everything else at default.
    pub fn with_scales(upsample_scales: Vec<i32>) -> Self {
        Self {
            upsample_scales,
            ..Self::default()
        }
    }

    /// Total upsampling factor.
    pub fn upsample_factor(&self) -> i32 {
        self.upsample_scales.iter().product()
    }

    /// Resolve the optional stage nonlinearity.
    pub fn activation(&self) -> Result<Option<Activation>> {
        match &self.nonlinear_activation {
            Some(name) => Ok(Some(Activation::from_name(name, &self.nonlinear_activation_params)?)),
            None if self.nonlinear_activation_params != ActivationParams::default() => Err(
                VocoderError::Config("nonlinear_activation_params given without nonlinear_activation".into()),
            ),
            None => Ok(None),
        }
    }

    /// Validate the upsampler parameters.
    pub fn validate(&self) -> Result<()> {
        if self.upsample_scales.is_empty() {
            return Err(VocoderError::Config("upsample_scales must not be empty".into()));
        }
        if let Some(s) = self.upsample_scales.iter().find(|&&s| s <= 0) {
            return Err(VocoderError::Config(format!(
                "upsample scales must be positive, got {s}"
            )));
        }
        if self.freq_axis_kernel_size <= 0 || self.freq_axis_kernel_size % 2 == 0 {
            return Err(VocoderError::Config(format!(
                "freq_axis_kernel_size must be a positive odd number, got {}",
                self.freq_axis_kernel_size
            )));
        }
        self.activation()?;
        Ok(())
    }
}

/// Parallel WaveGAN generator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Channels of the noise input.
    #[serde(default = "default_one")]
    pub in_channels: i32,

    /// Channels of the produced waveform.
    #[serde(default = "default_one")]
    pub out_channels: i32,

    /// Kernel size of the dilated convolutions.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: i32,

    /// Number of residual blocks.
    #[serde(default = "default_generator_layers")]
    pub layers: i32,

    /// Number of dilation cycles. Must divide `layers`.
    #[serde(default = "default_stacks")]
    pub stacks: i32,

    /// Channels of the residual stream.
    #[serde(default = "default_residual_channels")]
    pub residual_channels: i32,

    /// Channels of the gated convolution output (split in half).
    #[serde(default = "default_gate_channels")]
    pub gate_channels: i32,

    /// Channels of the skip stream.
    #[serde(default = "default_skip_channels")]
    pub skip_channels: i32,

    /// Channels of the conditioning features.
    #[serde(default = "default_aux_channels")]
    pub aux_channels: i32,

    /// Frames of context on each side consumed by the conditioning input conv.
    #[serde(default = "default_aux_context_window")]
    pub aux_context_window: i32,

    /// Dropout probability on the residual input during training.
    #[serde(default)]
    pub dropout: f32,

    /// Use bias in the residual block convolutions.
    #[serde(default = "default_true")]
    pub bias: bool,

    /// Decompose convolution kernels into direction and magnitude.
    #[serde(default = "default_true")]
    pub use_weight_norm: bool,

    /// Use causal convolutions.
    #[serde(default)]
    pub use_causal_conv: bool,

    /// Upsample the conditioning to the sample rate. When false the
    /// conditioning must already have the waveform length.
    #[serde(default = "default_true")]
    pub upsample_conditional_features: bool,

    /// Which upsampler to build.
    #[serde(default)]
    pub upsample_net: UpsampleNetKind,

    /// Upsampler parameters.
    #[serde(default)]
    pub upsample_params: UpsampleParams,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: default_kernel_size(),
            layers: default_generator_layers(),
            stacks: default_stacks(),
            residual_channels: default_residual_channels(),
            gate_channels: default_gate_channels(),
            skip_channels: default_skip_channels(),
            aux_channels: default_aux_channels(),
            aux_context_window: default_aux_context_window(),
            dropout: 0.0,
            bias: true,
            use_weight_norm: true,
            use_causal_conv: false,
            upsample_conditional_features: true,
            upsample_net: UpsampleNetKind::default(),
            upsample_params: UpsampleParams::default(),
        }
    }
}

impl GeneratorConfig {
    /// Residual blocks per dilation cycle.
    pub fn layers_per_stack(&self) -> i32 {
        self.layers / self.stacks.max(1)
    }

    /// Dilation of every residual block in order: 2^(layer mod layers_per_stack).
    pub fn dilations(&self) -> Vec<i32> {
        let per_stack = self.layers_per_stack().max(1);
        (0..self.layers).map(|layer| 1 << (layer % per_stack)).collect()
    }

    /// Samples of waveform produced per conditioning frame.
    pub fn hop_size(&self) -> i32 {
        if self.upsample_conditional_features {
            self.upsample_params.upsample_factor()
        } else {
            1
        }
    }

    /// Validate the generator configuration.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_size", self.kernel_size),
            ("layers", self.layers),
            ("stacks", self.stacks),
            ("residual_channels", self.residual_channels),
            ("gate_channels", self.gate_channels),
            ("skip_channels", self.skip_channels),
            ("aux_channels", self.aux_channels),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(VocoderError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if self.layers % self.stacks != 0 {
            return Err(VocoderError::Config(format!(
                "layers ({}) must be divisible by stacks ({}) to define the dilation cycle",
                self.layers, self.stacks
            )));
        }
        if self.layers_per_stack() > 30 {
            return Err(VocoderError::Config(format!(
                "dilation 2^{} overflows; use more stacks",
                self.layers_per_stack() - 1
            )));
        }
        if self.gate_channels % 2 != 0 {
            return Err(VocoderError::Config(format!(
                "gate_channels must be even to split the gate, got {}",
                self.gate_channels
            )));
        }
        if !self.use_causal_conv && self.kernel_size % 2 == 0 {
            return Err(VocoderError::Config(format!(
                "non-causal convolution needs an odd kernel_size, got {}",
                self.kernel_size
            )));
        }
        let receptive_field = self
            .dilations()
            .iter()
            .try_fold(0i32, |acc, &d| acc.checked_add(d))
            .and_then(|sum| sum.checked_mul(self.kernel_size - 1))
            .and_then(|span| span.checked_add(1));
        if receptive_field.is_none() {
            return Err(VocoderError::Config(format!(
                "kernel_size {} over {} layers per stack overflows the convolution padding",
                self.kernel_size,
                self.layers_per_stack()
            )));
        }
        if self.aux_context_window < 0 {
            return Err(VocoderError::Config(format!(
                "aux_context_window must be non-negative, got {}",
                self.aux_context_window
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(VocoderError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.upsample_conditional_features {
            self.upsample_params.validate()?;
        }
        let consumes_context =
            self.upsample_conditional_features && self.upsample_net == UpsampleNetKind::ConvInUpsampleNetwork;
        if self.aux_context_window != 0 && !consumes_context {
            // Only the ConvIn input convolution consumes context frames.
            return Err(VocoderError::Config(format!(
                "aux_context_window {} requires the ConvInUpsampleNetwork upsampler",
                self.aux_context_window
            )));
        }
        Ok(())
    }
}

/// Parallel WaveGAN discriminator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Channels of the input waveform.
    #[serde(default = "default_one")]
    pub in_channels: i32,

    /// Channels of the score map.
    #[serde(default = "default_one")]
    pub out_channels: i32,

    /// Kernel size. Must be odd.
    #[serde(default = "default_kernel_size")]
    pub kernel_size: i32,

    /// Number of convolution layers including the output projection.
    #[serde(default = "default_discriminator_layers")]
    pub layers: i32,

    /// Hidden channels.
    #[serde(default = "default_conv_channels")]
    pub conv_channels: i32,

    /// 1 for linear dilation growth, otherwise the exponential base.
    #[serde(default = "default_one")]
    pub dilation_factor: i32,

    /// Nonlinearity between convolutions.
    #[serde(default = "default_nonlinear_activation")]
    pub nonlinear_activation: String,

    /// Parameters of `nonlinear_activation`.
    #[serde(default = "default_nonlinear_activation_params")]
    pub nonlinear_activation_params: ActivationParams,

    /// Use bias in every convolution.
    #[serde(default = "default_true")]
    pub bias: bool,

    /// Decompose convolution kernels into direction and magnitude.
    #[serde(default = "default_true")]
    pub use_weight_norm: bool,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: default_kernel_size(),
            layers: default_discriminator_layers(),
            conv_channels: default_conv_channels(),
            dilation_factor: 1,
            nonlinear_activation: default_nonlinear_activation(),
            nonlinear_activation_params: default_nonlinear_activation_params(),
            bias: true,
            use_weight_norm: true,
        }
    }
}

impl DiscriminatorConfig {
    /// Resolve the configured nonlinearity.
    pub fn activation(&self) -> Result<Activation> {
        Activation::from_name(&self.nonlinear_activation, &self.nonlinear_activation_params)
    }

    /// Dilation of each hidden layer followed by the output layer's 1.
    pub fn dilations(&self) -> Vec<i32> {
        let mut dilations: Vec<i32> = (0..self.layers - 1)
            .map(|i| match i {
                0 => 1,
                _ if self.dilation_factor == 1 => i,
                _ => self.dilation_factor.pow(i as u32),
            })
            .collect();
        dilations.push(1);
        dilations
    }

    /// Validate the discriminator configuration.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_size", self.kernel_size),
            ("layers", self.layers),
            ("conv_channels", self.conv_channels),
            ("dilation_factor", self.dilation_factor),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(VocoderError::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if self.kernel_size % 2 == 0 {
            return Err(VocoderError::Config(format!(
                "discriminator kernel_size must be odd, got {}",
                self.kernel_size
            )));
        }
        let max_padding = self
            .dilation_factor
            .checked_pow((self.layers - 2).max(0) as u32)
            .and_then(|dilation| dilation.checked_mul(self.kernel_size - 1));
        if max_padding.is_none() {
            return Err(VocoderError::Config(format!(
                "dilation_factor {} overflows over {} layers",
                self.dilation_factor, self.layers
            )));
        }
        self.activation()?;
        Ok(())
    }
}

/// Multi-resolution STFT loss configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StftLossConfig {
    /// FFT size per resolution.
    #[serde(default = "default_fft_sizes")]
    pub fft_sizes: Vec<i32>,

    /// Hop size per resolution.
    #[serde(default = "default_hop_sizes")]
    pub hop_sizes: Vec<i32>,

    /// Window length per resolution.
    #[serde(default = "default_win_lengths")]
    pub win_lengths: Vec<i32>,

    /// Window function name, e.g. `hann_window`.
    #[serde(default = "default_window")]
    pub window: String,
}

impl Default for StftLossConfig {
    fn default() -> Self {
        Self {
            fft_sizes: default_fft_sizes(),
            hop_sizes: default_hop_sizes(),
            win_lengths: default_win_lengths(),
            window: default_window(),
        }
    }
}

impl StftLossConfig {
    /// Resolve the window name.
    pub fn window_kind(&self) -> Result<WindowKind> {
        WindowKind::from_name(&self.window)
    }

    /// `(fft_size, hop_size, win_length)` triples in order.
    pub fn resolutions(&self) -> impl Iterator<Item = (i32, i32, i32)> + '_ {
        self.fft_sizes
            .iter()
            .zip(&self.hop_sizes)
            .zip(&self.win_lengths)
            .map(|((&fft, &hop), &win)| (fft, hop, win))
    }

    /// Validate the loss configuration.
    pub fn validate(&self) -> Result<()> {
        let k = self.fft_sizes.len();
        if self.hop_sizes.len() != k || self.win_lengths.len() != k {
            return Err(VocoderError::Config(format!(
                "fft_sizes, hop_sizes and win_lengths must have equal length, got {}, {} and {}",
                k,
                self.hop_sizes.len(),
                self.win_lengths.len()
            )));
        }
        if k == 0 {
            return Err(VocoderError::Config("at least one STFT resolution is required".into()));
        }
        for (fft, hop, win) in self.resolutions() {
            if fft <= 0 || hop <= 0 || win <= 0 {
                return Err(VocoderError::Config(format!(
                    "STFT sizes must be positive, got fft={fft} hop={hop} win={win}"
                )));
            }
            if win > fft {
                return Err(VocoderError::Config(format!(
                    "win_length {win} exceeds fft_size {fft}"
                )));
            }
        }
        self.window_kind()?;
        Ok(())
    }
}

// Default functions for serde
fn default_one() -> i32 {
    1
}
fn default_true() -> bool {
    true
}
fn default_kernel_size() -> i32 {
    3
}
fn default_generator_layers() -> i32 {
    30
}
fn default_stacks() -> i32 {
    3
}
fn default_residual_channels() -> i32 {
    64
}
fn default_gate_channels() -> i32 {
    128
}
fn default_skip_channels() -> i32 {
    64
}
fn default_aux_channels() -> i32 {
    80
}
fn default_aux_context_window() -> i32 {
    2
}
fn default_upsample_scales() -> Vec<i32> {
    vec![4, 4, 4, 4]
}
fn default_freq_axis_kernel_size() -> i32 {
    1
}
fn default_discriminator_layers() -> i32 {
    10
}
fn default_conv_channels() -> i32 {
    64
}
fn default_nonlinear_activation() -> String {
    "LeakyReLU".to_string()
}
fn default_nonlinear_activation_params() -> ActivationParams {
    ActivationParams::negative_slope(0.2)
}
fn default_fft_sizes() -> Vec<i32> {
    vec![1024, 2048, 512]
}
fn default_hop_sizes() -> Vec<i32> {
    vec![120, 240, 50]
}
fn default_win_lengths() -> Vec<i32> {
    vec![600, 1200, 240]
}
fn default_window() -> String {
    "hann_window".to_string()
}

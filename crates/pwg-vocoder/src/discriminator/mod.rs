//! Parallel WaveGAN discriminator.
//!
//! A plain stack of dilated 1D convolutions without pooling or striding, so
//! the output is a per-sample realness score with the waveform's length.

use crate::config::DiscriminatorConfig;
use crate::error::{expect_ncl, Result};
use crate::nn::{Activation, Conv1d};
use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::ModuleParameters as _;
use mlx_rs::Array;

/// Fully convolutional waveform discriminator.
#[derive(Debug, ModuleParameters)]
pub struct ParallelWaveGanDiscriminator {
    /// Model configuration.
    pub config: DiscriminatorConfig,
    /// Hidden convolutions followed by the output projection.
    #[param]
    pub conv_layers: Vec<Conv1d>,
    /// Nonlinearity after every hidden convolution.
    pub activation: Activation,
}

impl ParallelWaveGanDiscriminator {
    /// Create a new discriminator from configuration.
    pub fn new(config: DiscriminatorConfig) -> Result<Self> {
        config.validate()?;
        let activation = config.activation()?;
        let dilations = config.dilations();
        let last = dilations.len() - 1;

        let mut conv_layers = Vec::with_capacity(dilations.len());
        for (i, &dilation) in dilations.iter().enumerate() {
            let in_channels = if i == 0 { config.in_channels } else { config.conv_channels };
            let out_channels = if i == last { config.out_channels } else { config.conv_channels };
            conv_layers.push(Conv1d::same_length(
                in_channels,
                out_channels,
                config.kernel_size,
                dilation,
                config.bias,
                false,
                config.use_weight_norm,
            )?);
        }

        let model = Self {
            config,
            conv_layers,
            activation,
        };
        tracing::debug!(
            layers = model.config.layers,
            activation = model.activation.name(),
            parameters = model.num_parameters(),
            "built Parallel WaveGAN discriminator"
        );
        Ok(model)
    }

    /// Total number of scalar parameters.
    pub fn num_parameters(&self) -> usize {
        self.parameters().flatten().values().map(|p| p.size()).sum()
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Waveform [batch, in_channels, T]
    ///
    /// # Returns
    /// Score map [batch, out_channels, T]
    pub fn forward(&self, x: &Array) -> Result<Array> {
        expect_ncl(x, self.config.in_channels, "discriminator input")?;
        let last = self.conv_layers.len() - 1;
        let mut h = x.clone();
        for (i, conv) in self.conv_layers.iter().enumerate() {
            h = conv.forward(&h)?;
            if i != last {
                h = self.activation.forward(&h)?;
            }
        }
        Ok(h)
    }

    /// Fuse every weight-normalized kernel into a plain kernel.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        for conv in self.conv_layers.iter_mut() {
            conv.kernel.remove_weight_norm()?;
        }
        tracing::debug!(layers = self.conv_layers.len(), "removed weight normalization from discriminator");
        Ok(())
    }

    /// Decompose every plain kernel into direction and magnitude.
    pub fn apply_weight_norm(&mut self) -> Result<()> {
        for conv in self.conv_layers.iter_mut() {
            conv.kernel.apply_weight_norm()?;
        }
        Ok(())
    }
}

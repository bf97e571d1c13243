//! Gated residual block with auxiliary conditioning.

use crate::error::{expect_ncl, Result, VocoderError};
use crate::nn::{gated_tanh, Conv1d};
use crate::random::RandomSource;
use mlx_rs::macros::ModuleParameters;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use std::f32::consts::FRAC_1_SQRT_2;

/// Hyperparameters of one residual block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualBlockConfig {
    /// Kernel size of the dilated convolution.
    pub kernel_size: i32,
    /// Residual stream channels.
    pub residual_channels: i32,
    /// Gated convolution output channels (split in half).
    pub gate_channels: i32,
    /// Skip output channels.
    pub skip_channels: i32,
    /// Conditioning channels.
    pub aux_channels: i32,
    /// Dilation of the gated convolution.
    pub dilation: i32,
    /// Dropout on the block input during training.
    pub dropout: f32,
    /// Use bias in the convolutions.
    pub bias: bool,
    /// Use a causal gated convolution.
    pub causal: bool,
    /// Weight-normalize every convolution.
    pub use_weight_norm: bool,
}

/// Dilated gated convolution unit.
///
/// ```text
///   x ──dropout──conv(k, d)──┬─ a ─(+ aux_a)─ tanh ─┐
///                            └─ b ─(+ aux_b)─ σ ────┴─ z
///   z ──1x1──> skip
///   z ──1x1──(+ x)·√0.5──> residual
/// ```
#[derive(Debug, ModuleParameters)]
pub struct ResidualBlock {
    /// Dilated gated convolution: residual -> gate channels.
    #[param]
    pub conv: Conv1d,
    /// Conditioning projection: aux -> gate channels, no bias.
    #[param]
    pub conv1x1_aux: Conv1d,
    /// Projection back to the residual stream.
    #[param]
    pub conv1x1_out: Conv1d,
    /// Projection to the skip stream.
    #[param]
    pub conv1x1_skip: Conv1d,
    /// Dropout probability.
    pub dropout: f32,
}

impl ResidualBlock {
    /// Create a new residual block.
    pub fn new(config: &ResidualBlockConfig) -> Result<Self> {
        if config.gate_channels % 2 != 0 {
            return Err(VocoderError::Config(format!(
                "gate_channels must be even, got {}",
                config.gate_channels
            )));
        }
        let half = config.gate_channels / 2;
        let wn = config.use_weight_norm;

        Ok(Self {
            conv: Conv1d::same_length(
                config.residual_channels,
                config.gate_channels,
                config.kernel_size,
                config.dilation,
                config.bias,
                config.causal,
                wn,
            )?,
            conv1x1_aux: Conv1d::pointwise(config.aux_channels, config.gate_channels, false, wn)?,
            conv1x1_out: Conv1d::pointwise(half, config.residual_channels, config.bias, wn)?,
            conv1x1_skip: Conv1d::pointwise(half, config.skip_channels, config.bias, wn)?,
            dropout: config.dropout,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Residual stream [batch, residual_channels, time]
    /// * `c` - Conditioning [batch, aux_channels, time]
    /// * `rng` - Random source for dropout; `None` disables dropout
    ///
    /// # Returns
    /// Tuple of (residual output [batch, residual_channels, time],
    /// skip output [batch, skip_channels, time])
    pub fn forward(&self, x: &Array, c: &Array, rng: Option<&mut RandomSource>) -> Result<(Array, Array)> {
        expect_ncl(c, self.conv1x1_aux.in_channels, "conditioning")?;
        if c.dim(2) != x.dim(2) || c.dim(0) != x.dim(0) {
            return Err(VocoderError::ShapeMismatch {
                expected: vec![x.dim(0), c.dim(1), x.dim(2)],
                actual: c.shape().to_vec(),
            });
        }
        let residual = x;

        let h = match rng {
            Some(rng) => rng.dropout(x, self.dropout)?,
            None => x.clone(),
        };
        let h = self.conv.forward(&h)?;

        let half = self.conv.out_channels / 2;
        let aux = self.conv1x1_aux.forward(c)?;
        let a = h.index((.., ..half, ..)).add(&aux.index((.., ..half, ..)))?;
        let b = h.index((.., half.., ..)).add(&aux.index((.., half.., ..)))?;
        let z = gated_tanh(&a, &b)?;

        let skip = self.conv1x1_skip.forward(&z)?;
        let out = self
            .conv1x1_out
            .forward(&z)?
            .add(residual)?
            .multiply(&Array::from_f32(FRAC_1_SQRT_2))?;

        Ok((out, skip))
    }

    /// Every convolution in the block.
    pub fn convs_mut(&mut self) -> [&mut Conv1d; 4] {
        [
            &mut self.conv,
            &mut self.conv1x1_aux,
            &mut self.conv1x1_out,
            &mut self.conv1x1_skip,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(causal: bool) -> ResidualBlockConfig {
        ResidualBlockConfig {
            kernel_size: 3,
            residual_channels: 8,
            gate_channels: 16,
            skip_channels: 4,
            aux_channels: 10,
            dilation: 4,
            dropout: 0.0,
            bias: true,
            causal,
            use_weight_norm: true,
        }
    }

    #[test]
    fn test_output_shapes() {
        for causal in [false, true] {
            let block = ResidualBlock::new(&config(causal)).unwrap();
            let x = mlx_rs::random::normal::<f32>(&[2, 8, 64], None, None, None).unwrap();
            let c = mlx_rs::random::normal::<f32>(&[2, 10, 64], None, None, None).unwrap();
            let (out, skip) = block.forward(&x, &c, None).unwrap();
            out.eval().unwrap();
            skip.eval().unwrap();
            assert_eq!(out.shape(), &[2, 8, 64]);
            assert_eq!(skip.shape(), &[2, 4, 64]);
        }
    }

    #[test]
    fn test_conditioning_length_mismatch() {
        let block = ResidualBlock::new(&config(false)).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 8, 64], None, None, None).unwrap();
        let c = mlx_rs::random::normal::<f32>(&[2, 10, 63], None, None, None).unwrap();
        assert!(block.forward(&x, &c, None).unwrap_err().is_shape());
    }

    #[test]
    fn test_odd_gate_channels_rejected() {
        let cfg = ResidualBlockConfig {
            gate_channels: 15,
            ..config(false)
        };
        assert!(ResidualBlock::new(&cfg).unwrap_err().is_config());
    }

    #[test]
    fn test_dropout_uses_random_source() {
        let cfg = ResidualBlockConfig {
            dropout: 0.5,
            ..config(false)
        };
        let block = ResidualBlock::new(&cfg).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[1, 8, 32], None, None, None).unwrap();
        let c = mlx_rs::random::normal::<f32>(&[1, 10, 32], None, None, None).unwrap();

        let mut rng = RandomSource::new(11);
        block.forward(&x, &c, Some(&mut rng)).unwrap();
        assert_eq!(rng.draws(), 1);
    }
}

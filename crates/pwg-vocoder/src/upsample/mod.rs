//! Conditioning upsampler.
//!
//! Brings frame-rate conditioning (e.g. a mel-spectrogram) up to the
//! waveform's sample rate. Each stage stretches the time axis by nearest
//! neighbour repetition and smooths the result with a small 2D convolution
//! that spans a few channels and `2 * scale + 1` samples.

use crate::config::{UpsampleNetKind, UpsampleParams};
use crate::error::{expect_ncl, Result, VocoderError};
use crate::nn::{Activation, Conv1d, Conv2d, ConvWeight};
use mlx_rs::macros::ModuleParameters;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;

/// One stretch + smooth stage.
#[derive(Debug, ModuleParameters)]
pub struct UpsampleStage {
    /// Smoothing convolution over (channels, time).
    #[param]
    pub conv: Conv2d,
    /// Stretch factor.
    pub scale: i32,
    /// Drop the look-ahead outputs after smoothing.
    pub causal: bool,
    /// Optional nonlinearity after smoothing.
    pub activation: Option<Activation>,
}

impl UpsampleStage {
    /// Create a stage for `scale` with a `freq_axis_kernel_size` tall kernel.
    pub fn new(
        scale: i32,
        freq_axis_kernel_size: i32,
        causal: bool,
        activation: Option<Activation>,
        use_weight_norm: bool,
    ) -> Result<Self> {
        if scale <= 0 {
            return Err(VocoderError::Config(format!("upsample scale must be positive, got {scale}")));
        }
        if freq_axis_kernel_size <= 0 || freq_axis_kernel_size % 2 == 0 {
            return Err(VocoderError::Config(format!(
                "freq_axis_kernel_size must be a positive odd number, got {freq_axis_kernel_size}"
            )));
        }
        let freq_padding = (freq_axis_kernel_size - 1) / 2;
        let time_padding = if causal { 2 * scale } else { scale };
        let conv = Conv2d::box_filter(
            freq_axis_kernel_size,
            2 * scale + 1,
            freq_padding,
            time_padding,
            use_weight_norm,
        )?;

        Ok(Self {
            conv,
            scale,
            causal,
            activation,
        })
    }

    /// Stretch `[batch, channels, frames]` to `[batch, channels, frames * scale]`.
    pub fn forward(&self, c: &Array) -> Result<Array> {
        let (batch, channels, frames) = (c.dim(0), c.dim(1), c.dim(2));
        let stretched_len = frames * self.scale;

        let stretched = mlx_rs::ops::broadcast_to(
            &c.reshape(&[batch, channels, frames, 1])?,
            &[batch, channels, frames, self.scale],
        )?
        .reshape(&[batch, channels, stretched_len])?;

        let mut y = self.conv.forward(&stretched)?;
        if self.causal {
            y = y.index((.., .., ..stretched_len));
        }
        if let Some(act) = &self.activation {
            y = act.forward(&y)?;
        }
        Ok(y)
    }
}

/// Conditioning upsampler, optionally preceded by a context-consuming
/// input convolution.
#[derive(Debug, ModuleParameters)]
pub struct UpsampleNetwork {
    /// Input convolution over `2 * aux_context_window + 1` frames
    /// (`aux_context_window + 1` when causal). Present for
    /// [`UpsampleNetKind::ConvInUpsampleNetwork`].
    #[param]
    pub conv_in: Option<Conv1d>,
    /// Stretch stages, one per upsample scale.
    #[param]
    pub stages: Vec<UpsampleStage>,
    /// Variant.
    pub kind: UpsampleNetKind,
    /// Conditioning channels.
    pub aux_channels: i32,
    /// Context frames expected on each side of the conditioning.
    pub aux_context_window: i32,
    /// Causal mode.
    pub causal: bool,
}

impl UpsampleNetwork {
    /// Build the upsampler.
    pub fn new(
        kind: UpsampleNetKind,
        params: &UpsampleParams,
        aux_channels: i32,
        aux_context_window: i32,
        causal: bool,
        use_weight_norm: bool,
    ) -> Result<Self> {
        params.validate()?;
        if aux_context_window < 0 {
            return Err(VocoderError::Config(format!(
                "aux_context_window must be non-negative, got {aux_context_window}"
            )));
        }
        if kind == UpsampleNetKind::UpsampleNetwork && aux_context_window != 0 {
            return Err(VocoderError::Config(
                "UpsampleNetwork does not consume context frames; use ConvInUpsampleNetwork".into(),
            ));
        }

        let conv_in = match kind {
            UpsampleNetKind::ConvInUpsampleNetwork => {
                let kernel_size = if causal {
                    aux_context_window + 1
                } else {
                    2 * aux_context_window + 1
                };
                Some(Conv1d::new(aux_channels, aux_channels, kernel_size, 0, 1, false, use_weight_norm)?)
            }
            UpsampleNetKind::UpsampleNetwork => None,
        };

        let activation = params.activation()?;
        let stages = params
            .upsample_scales
            .iter()
            .map(|&scale| {
                UpsampleStage::new(scale, params.freq_axis_kernel_size, causal, activation, use_weight_norm)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            conv_in,
            stages,
            kind,
            aux_channels,
            aux_context_window,
            causal,
        })
    }

    /// Total upsampling factor.
    pub fn upsample_factor(&self) -> i32 {
        self.stages.iter().map(|s| s.scale).product()
    }

    /// Conditioning frames consumed as context (both sides together).
    pub fn context_frames(&self) -> i32 {
        if self.conv_in.is_some() {
            2 * self.aux_context_window
        } else {
            0
        }
    }

    /// Samples produced for `frames` input frames.
    ///
    /// Fails with a shape error when the input does not cover the context
    /// margin.
    pub fn output_length(&self, frames: i32) -> Result<i32> {
        let usable = frames - self.context_frames();
        if usable <= 0 {
            return Err(VocoderError::Shape(format!(
                "conditioning of {frames} frames does not cover the {} context frames",
                self.context_frames()
            )));
        }
        Ok(usable * self.upsample_factor())
    }

    /// Every convolution kernel in the upsampler.
    pub fn conv_weights_mut(&mut self) -> Vec<&mut ConvWeight> {
        let mut weights: Vec<&mut ConvWeight> = self.conv_in.iter_mut().map(|conv| &mut conv.kernel).collect();
        weights.extend(self.stages.iter_mut().map(|stage| &mut stage.conv.kernel));
        weights
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `c` - Conditioning [batch, aux_channels, frames + 2 * aux_context_window]
    ///
    /// # Returns
    /// Upsampled conditioning [batch, aux_channels, frames * upsample_factor]
    pub fn forward(&self, c: &Array) -> Result<Array> {
        expect_ncl(c, self.aux_channels, "conditioning")?;
        self.output_length(c.dim(2))?;

        let mut c = match &self.conv_in {
            Some(conv_in) => {
                let y = conv_in.forward(c)?;
                if self.causal && self.aux_context_window > 0 {
                    let keep = y.dim(2) - self.aux_context_window;
                    y.index((.., .., ..keep))
                } else {
                    y
                }
            }
            None => c.clone(),
        };

        for stage in &self.stages {
            c = stage.forward(&c)?;
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::ActivationParams;

    /// Add 3.0 at time index `t` in every channel.
    fn bump_at(x: &Array, t: i32) -> Array {
        let (batch, channels, len) = (x.dim(0), x.dim(1), x.dim(2));
        let mut data = vec![0.0f32; (batch * channels * len) as usize];
        for row in 0..(batch * channels) {
            data[(row * len + t) as usize] = 3.0;
        }
        x.add(&Array::from_slice(&data, &[batch, channels, len])).unwrap()
    }

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        let diff = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
        diff.eval().unwrap();
        diff.item::<f32>()
    }

    #[test]
    fn test_stage_stretches_by_scale() {
        for causal in [false, true] {
            let stage = UpsampleStage::new(4, 3, causal, None, false).unwrap();
            let c = mlx_rs::random::normal::<f32>(&[2, 10, 8], None, None, None).unwrap();
            let y = stage.forward(&c).unwrap();
            y.eval().unwrap();
            assert_eq!(y.shape(), &[2, 10, 32]);
        }
    }

    #[test]
    fn test_stage_is_nearest_neighbour_inside_constant_runs() {
        let stage = UpsampleStage::new(2, 1, false, None, false).unwrap();
        let c = Array::from_slice(&[1.0f32, 1.0, 1.0, 1.0], &[1, 1, 4]);
        let y = stage.forward(&c).unwrap();
        y.eval().unwrap();
        let vals = y.as_slice::<f32>();
        // Box filter of width 5 over a constant run reproduces the constant.
        assert!((vals[3] - 1.0).abs() < 1e-6);
        assert!((vals[4] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_conv_in_consumes_context() {
        let params = UpsampleParams::with_scales(vec![4, 4]);
        for causal in [false, true] {
            let net = UpsampleNetwork::new(UpsampleNetKind::ConvInUpsampleNetwork, &params, 10, 2, causal, true)
                .unwrap();
            let c = mlx_rs::random::normal::<f32>(&[2, 10, 16 + 4], None, None, None).unwrap();
            let y = net.forward(&c).unwrap();
            y.eval().unwrap();
            assert_eq!(y.shape(), &[2, 10, 256]);
            assert_eq!(net.output_length(20).unwrap(), 256);
        }
    }

    #[test]
    fn test_plain_network_keeps_frames() {
        let params = UpsampleParams {
            freq_axis_kernel_size: 3,
            nonlinear_activation: Some("LeakyReLU".into()),
            nonlinear_activation_params: ActivationParams::negative_slope(0.4),
            ..UpsampleParams::with_scales(vec![4])
        };
        let net = UpsampleNetwork::new(UpsampleNetKind::UpsampleNetwork, &params, 10, 0, false, true).unwrap();
        assert!(net.conv_in.is_none());
        let c = mlx_rs::random::normal::<f32>(&[1, 10, 16], None, None, None).unwrap();
        let y = net.forward(&c).unwrap();
        y.eval().unwrap();
        assert_eq!(y.shape(), &[1, 10, 64]);
    }

    #[test]
    fn test_too_short_for_context() {
        let params = UpsampleParams::with_scales(vec![4]);
        let net = UpsampleNetwork::new(UpsampleNetKind::ConvInUpsampleNetwork, &params, 10, 2, false, false).unwrap();
        let c = mlx_rs::random::normal::<f32>(&[1, 10, 4], None, None, None).unwrap();
        assert!(net.forward(&c).unwrap_err().is_shape());
    }

    #[test]
    fn test_plain_network_rejects_context() {
        let params = UpsampleParams::with_scales(vec![4]);
        let err = UpsampleNetwork::new(UpsampleNetKind::UpsampleNetwork, &params, 10, 2, false, false).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_causal_network_has_no_future_leakage() {
        let params = UpsampleParams::with_scales(vec![4, 4]);
        let acw = 2;
        let net = UpsampleNetwork::new(UpsampleNetKind::ConvInUpsampleNetwork, &params, 10, acw, true, true).unwrap();
        let c = mlx_rs::random::normal::<f32>(&[1, 10, 16 + 2 * acw], None, None, None).unwrap();

        // Frame k first reaches conv_in output k - acw, i.e. sample (k - acw) * 16.
        let k = 10;
        let boundary = (k - acw) * 16;
        let y1 = net.forward(&c).unwrap();
        let y2 = net.forward(&bump_at(&c, k)).unwrap();
        assert_eq!(y1.shape(), &[1, 10, 256]);

        let past = max_abs_diff(&y1.index((.., .., ..boundary)), &y2.index((.., .., ..boundary)));
        assert!(past < 1e-6, "earlier samples moved by {past}");
        let future = max_abs_diff(&y1.index((.., .., boundary..)), &y2.index((.., .., boundary..)));
        assert!(future > 1e-4);
    }

    #[test]
    fn test_causal_stage_has_no_future_leakage() {
        let stage = UpsampleStage::new(4, 3, true, None, false).unwrap();
        let c = mlx_rs::random::normal::<f32>(&[1, 6, 8], None, None, None).unwrap();
        let last = c.dim(2) - 1;
        let y1 = stage.forward(&c).unwrap();
        let y2 = stage.forward(&bump_at(&c, last)).unwrap();

        let boundary = last * 4;
        let past = max_abs_diff(&y1.index((.., .., ..boundary)), &y2.index((.., .., ..boundary)));
        assert!(past < 1e-6, "earlier samples moved by {past}");
    }
}

//! Convolution layers with optional weight normalization.
//!
//! Every convolution in the generator and discriminator stores its kernel in a
//! [`ConvWeight`], which is either a plain kernel or a weight-normalized pair
//! W = g * (v / ||v||). Weight normalization is selected at construction and
//! can be fused back into a plain kernel with
//! [`ConvWeight::remove_weight_norm`] before the weights are handed to a
//! serializer.

use crate::error::{expect_ncl, Result, VocoderError};
use mlx_rs::macros::ModuleParameters;
use mlx_rs::module::Param;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;

/// Kernel storage for a convolution.
///
/// Without weight normalization `weight` is the kernel itself and `weight_g`
/// is `None`. With weight normalization `weight` holds the direction `v` and
/// `weight_g` the per-output-channel magnitude `g`.
#[derive(Debug, ModuleParameters)]
pub struct ConvWeight {
    /// Plain kernel, or the direction `v` when weight-normalized.
    #[param]
    pub weight: Param<Array>,
    /// Magnitude `g`, shaped `[out, 1, ...]`; present only when normalized.
    #[param]
    pub weight_g: Param<Option<Array>>,
}

impl ConvWeight {
    /// Wrap a kernel, optionally decomposing it into direction and magnitude.
    ///
    /// The decomposition starts with g = ||v|| so the effective kernel is
    /// unchanged.
    pub fn new(kernel: Array, use_weight_norm: bool) -> Result<Self> {
        let mut weight = Self {
            weight: Param::new(kernel),
            weight_g: Param::new(None),
        };
        if use_weight_norm {
            weight.apply_weight_norm()?;
        }
        Ok(weight)
    }

    /// Whether the kernel is currently weight-normalized.
    pub fn is_weight_normalized(&self) -> bool {
        self.weight_g.as_ref().is_some()
    }

    /// Effective kernel used by the convolution.
    pub fn kernel(&self) -> Result<Array> {
        let v = self.weight.as_ref();
        match self.weight_g.as_ref() {
            Some(g) => {
                let norm = weight_norm(v)?;
                Ok(v.divide(&norm)?.multiply(g)?)
            }
            None => Ok(v.clone()),
        }
    }

    /// Decompose the current kernel into direction and magnitude.
    ///
    /// No-op when already normalized.
    pub fn apply_weight_norm(&mut self) -> Result<()> {
        if self.is_weight_normalized() {
            return Ok(());
        }
        let g = weight_norm(self.weight.as_ref())?;
        self.weight_g = Param::new(Some(g));
        Ok(())
    }

    /// Fuse direction and magnitude back into a plain kernel.
    ///
    /// No-op when not normalized.
    pub fn remove_weight_norm(&mut self) -> Result<()> {
        if !self.is_weight_normalized() {
            return Ok(());
        }
        let fused = self.kernel()?;
        fused.eval()?;
        self.weight = Param::new(fused);
        self.weight_g = Param::new(None);
        Ok(())
    }
}

/// 1D convolution over NCL tensors with stride 1.
///
/// In causal mode the input is padded by `(kernel_size - 1) * dilation` on
/// both sides and the trailing outputs are dropped, so output `t` only sees
/// inputs `<= t` and the output length equals the input length.
#[derive(Debug, ModuleParameters)]
pub struct Conv1d {
    /// Kernel `[out_channels, in_channels, kernel_size]`.
    #[param]
    pub kernel: ConvWeight,
    /// Optional bias `[out_channels]`.
    #[param]
    pub bias: Param<Option<Array>>,
    /// Input channels.
    pub in_channels: i32,
    /// Output channels.
    pub out_channels: i32,
    /// Kernel size.
    pub kernel_size: i32,
    /// Zero padding applied on both sides.
    pub padding: i32,
    /// Dilation.
    pub dilation: i32,
    /// Trim outputs to the input length after padding.
    pub causal: bool,
}

impl Conv1d {
    /// Create a new Conv1d with Kaiming-normal weights and zero bias.
    pub fn new(
        in_channels: i32,
        out_channels: i32,
        kernel_size: i32,
        padding: i32,
        dilation: i32,
        bias: bool,
        use_weight_norm: bool,
    ) -> Result<Self> {
        if in_channels <= 0 || out_channels <= 0 || kernel_size <= 0 || dilation <= 0 {
            return Err(VocoderError::Config(format!(
                "invalid Conv1d geometry: in={in_channels} out={out_channels} kernel={kernel_size} dilation={dilation}"
            )));
        }
        if padding < 0 {
            return Err(VocoderError::Config(format!("negative Conv1d padding {padding}")));
        }

        let fan_in = in_channels * kernel_size;
        let kernel = kaiming_normal(&[out_channels, in_channels, kernel_size], fan_in)?;

        let bias = if bias {
            Param::new(Some(mlx_rs::ops::zeros::<f32>(&[out_channels])?))
        } else {
            Param::new(None)
        };

        Ok(Self {
            kernel: ConvWeight::new(kernel, use_weight_norm)?,
            bias,
            in_channels,
            out_channels,
            kernel_size,
            padding,
            dilation,
            causal: false,
        })
    }

    /// Pointwise convolution.
    pub fn pointwise(in_channels: i32, out_channels: i32, bias: bool, use_weight_norm: bool) -> Result<Self> {
        Self::new(in_channels, out_channels, 1, 0, 1, bias, use_weight_norm)
    }

    /// Dilated convolution that preserves the time length.
    ///
    /// Causal mode pads `(kernel_size - 1) * dilation` and trims; non-causal
    /// mode pads symmetrically and requires an odd kernel.
    pub fn same_length(
        in_channels: i32,
        out_channels: i32,
        kernel_size: i32,
        dilation: i32,
        bias: bool,
        causal: bool,
        use_weight_norm: bool,
    ) -> Result<Self> {
        let span = (kernel_size - 1).checked_mul(dilation).ok_or_else(|| {
            VocoderError::Config(format!("kernel size {kernel_size} at dilation {dilation} overflows the padding"))
        })?;
        let padding = if causal {
            span
        } else {
            if (kernel_size - 1) % 2 != 0 {
                return Err(VocoderError::Config(format!(
                    "non-causal convolution needs an odd kernel size, got {kernel_size}"
                )));
            }
            span / 2
        };
        let mut conv = Self::new(in_channels, out_channels, kernel_size, padding, dilation, bias, use_weight_norm)?;
        conv.causal = causal;
        Ok(conv)
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input tensor [batch, in_channels, length] (NCL format)
    ///
    /// # Returns
    /// Output tensor [batch, out_channels, new_length] (NCL format)
    pub fn forward(&self, x: &Array) -> Result<Array> {
        expect_ncl(x, self.in_channels, "Conv1d input")?;
        let length = x.dim(2);
        let weight = self.kernel.kernel()?;

        // MLX conv1d expects NLC input and OKI weights.
        let x_nlc = x.transpose_axes(&[0, 2, 1])?;
        let weight_oki = weight.transpose_axes(&[0, 2, 1])?;
        let output = mlx_rs::ops::conv1d(&x_nlc, &weight_oki, 1, self.padding, self.dilation, 1)?;
        let mut output = output.transpose_axes(&[0, 2, 1])?;

        if self.causal {
            output = output.index((.., .., ..length));
        }

        if let Some(bias) = self.bias.as_ref() {
            let bias = bias.reshape(&[1, self.out_channels, 1])?;
            output = output.add(&bias)?;
        }
        Ok(output)
    }

    /// Output length for an input of `length` samples.
    pub fn output_length(&self, length: i32) -> i32 {
        let full = length + 2 * self.padding - self.dilation * (self.kernel_size - 1);
        if self.causal {
            full.min(length)
        } else {
            full
        }
    }
}

/// Single-plane 2D convolution used to smooth stretched conditioning.
///
/// Operates on `[batch, height, width]` tensors (frequency × time), with one
/// input and one output plane.
#[derive(Debug, ModuleParameters)]
pub struct Conv2d {
    /// Kernel `[1, kernel_h, kernel_w]`.
    #[param]
    pub kernel: ConvWeight,
    /// Kernel height (frequency axis).
    pub kernel_h: i32,
    /// Kernel width (time axis).
    pub kernel_w: i32,
    /// Padding on the frequency axis.
    pub padding_h: i32,
    /// Padding on the time axis.
    pub padding_w: i32,
}

impl Conv2d {
    /// Create a bias-free 2D convolution initialized to a box filter.
    pub fn box_filter(
        kernel_h: i32,
        kernel_w: i32,
        padding_h: i32,
        padding_w: i32,
        use_weight_norm: bool,
    ) -> Result<Self> {
        if kernel_h <= 0 || kernel_w <= 0 || padding_h < 0 || padding_w < 0 {
            return Err(VocoderError::Config(format!(
                "invalid Conv2d geometry: kernel=({kernel_h}, {kernel_w}) padding=({padding_h}, {padding_w})"
            )));
        }
        let value = Array::from_f32(1.0 / (kernel_h * kernel_w) as f32);
        let kernel = mlx_rs::ops::ones::<f32>(&[1, kernel_h, kernel_w])?.multiply(&value)?;

        Ok(Self {
            kernel: ConvWeight::new(kernel, use_weight_norm)?,
            kernel_h,
            kernel_w,
            padding_h,
            padding_w,
        })
    }

    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Input plane [batch, height, width]
    ///
    /// # Returns
    /// Output plane [batch, height', width']
    pub fn forward(&self, x: &Array) -> Result<Array> {
        if x.ndim() != 3 {
            return Err(VocoderError::Shape(format!(
                "Conv2d input must be (batch, height, width), got {:?}",
                x.shape()
            )));
        }
        let (batch, height, width) = (x.dim(0), x.dim(1), x.dim(2));
        let weight = self.kernel.kernel()?;

        // MLX conv2d expects NHWC input and OHWI weights.
        let x_nhwc = x.reshape(&[batch, height, width, 1])?;
        let weight_ohwi = weight.reshape(&[1, self.kernel_h, self.kernel_w, 1])?;
        let output = mlx_rs::ops::conv2d(
            &x_nhwc,
            &weight_ohwi,
            (1, 1),
            (self.padding_h, self.padding_w),
            (1, 1),
            1,
        )?;

        let out_h = output.dim(1);
        let out_w = output.dim(2);
        Ok(output.reshape(&[batch, out_h, out_w])?)
    }
}

/// Kaiming-normal initialization with ReLU gain: N(0, 2 / fan_in).
fn kaiming_normal(shape: &[i32], fan_in: i32) -> Result<Array> {
    let std = (2.0 / fan_in as f32).sqrt();
    let w = mlx_rs::random::normal::<f32>(shape, None, None, None)?;
    Ok(w.multiply(&Array::from_f32(std))?)
}

/// Compute the norm over every axis except the first (output channels).
/// Keeps dims for broadcasting, e.g. `[out, 1, 1]`.
fn weight_norm(weight: &Array) -> Result<Array> {
    let axes: Vec<i32> = (1..weight.ndim() as i32).collect();
    let sq = weight.multiply(weight)?;
    let sum_sq = sq.sum_axes(&axes, Some(true))?;
    let norm = sum_sq.sqrt()?;

    let eps = Array::from_f32(1e-12);
    Ok(norm.add(&eps)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        let d = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
        d.eval().unwrap();
        d.item::<f32>()
    }

    #[test]
    fn test_conv1d_same_length_non_causal() {
        let conv = Conv1d::same_length(4, 8, 3, 4, true, false, true).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 4, 32], None, None, None).unwrap();
        let y = conv.forward(&x).unwrap();
        y.eval().unwrap();
        assert_eq!(y.shape(), &[2, 8, 32]);
        assert_eq!(conv.output_length(32), 32);
    }

    #[test]
    fn test_conv1d_same_length_causal() {
        let conv = Conv1d::same_length(4, 8, 3, 2, true, true, false).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 4, 32], None, None, None).unwrap();
        let y = conv.forward(&x).unwrap();
        y.eval().unwrap();
        assert_eq!(y.shape(), &[2, 8, 32]);
        assert_eq!(conv.output_length(32), 32);
    }

    #[test]
    fn test_causal_conv_has_no_future_leakage() {
        let conv = Conv1d::same_length(1, 1, 3, 2, false, true, false).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[1, 1, 16], None, None, None).unwrap();

        // Perturb only the last sample; earlier outputs must not move.
        let bump = mlx_rs::ops::zeros::<f32>(&[1, 1, 15]).unwrap();
        let bump = mlx_rs::ops::concatenate_axis(&[&bump, &Array::from_slice(&[5.0f32], &[1, 1, 1])], 2).unwrap();
        let x2 = x.add(&bump).unwrap();

        let y1 = conv.forward(&x).unwrap().index((.., .., ..15));
        let y2 = conv.forward(&x2).unwrap().index((.., .., ..15));
        assert!(max_abs_diff(&y1, &y2) < 1e-6);
    }

    #[test]
    fn test_padding_overflow_rejected() {
        let err = Conv1d::same_length(1, 1, 5, 1 << 29, false, true, false).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_even_kernel_non_causal_rejected() {
        let err = Conv1d::same_length(4, 4, 4, 1, true, false, false).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_conv1d_channel_mismatch() {
        let conv = Conv1d::pointwise(4, 8, true, false).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 3, 16], None, None, None).unwrap();
        assert!(conv.forward(&x).unwrap_err().is_shape());
    }

    #[test]
    fn test_weight_norm_preserves_kernel() {
        let kernel = mlx_rs::random::normal::<f32>(&[4, 2, 3], None, None, None).unwrap();
        let plain = ConvWeight::new(kernel.clone(), false).unwrap();
        let normalized = ConvWeight::new(kernel, true).unwrap();

        assert!(!plain.is_weight_normalized());
        assert!(normalized.is_weight_normalized());
        assert_eq!(normalized.weight_g.as_ref().as_ref().unwrap().shape(), &[4, 1, 1]);
        assert!(max_abs_diff(&plain.kernel().unwrap(), &normalized.kernel().unwrap()) < 1e-5);
    }

    #[test]
    fn test_remove_weight_norm_fuses_kernel() {
        let conv_kernel = mlx_rs::random::normal::<f32>(&[4, 2, 3], None, None, None).unwrap();
        let mut weight = ConvWeight::new(conv_kernel, true).unwrap();

        // Scale the magnitude so the fused kernel differs from v.
        let g = weight.weight_g.as_ref().as_ref().unwrap().multiply(&Array::from_f32(2.0)).unwrap();
        weight.weight_g = Param::new(Some(g));
        let before = weight.kernel().unwrap();

        weight.remove_weight_norm().unwrap();
        assert!(!weight.is_weight_normalized());
        assert!(max_abs_diff(&before, &weight.kernel().unwrap()) < 1e-5);
    }

    #[test]
    fn test_conv2d_box_filter_smooths_constant() {
        let conv = Conv2d::box_filter(1, 9, 0, 4, false).unwrap();
        let x = mlx_rs::ops::ones::<f32>(&[1, 3, 32]).unwrap();
        let y = conv.forward(&x).unwrap();
        y.eval().unwrap();
        assert_eq!(y.shape(), &[1, 3, 32]);

        // Away from the zero-padded edges a box filter leaves a constant unchanged.
        let interior = y.index((.., .., 4..28));
        let ones = mlx_rs::ops::ones::<f32>(&[1, 3, 24]).unwrap();
        assert!(max_abs_diff(&interior, &ones) < 1e-5);
    }
}

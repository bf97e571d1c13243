//! Differentiable magnitude STFT using MLX.
//!
//! The transform multiplies framed signals by precomputed windowed DFT bases,
//! so it stays in real arithmetic and gradients flow through it like any other
//! matmul.

use crate::audio::WindowKind;
use crate::error::{Result, VocoderError};
use mlx_rs::Array;
use std::f64::consts::PI;

/// Floor applied to the power spectrum before the square root.
pub const MAGNITUDE_FLOOR: f32 = 1e-7;

/// Padding modes for time-axis padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PadMode {
    /// Reflect padding (mirror, edge sample not repeated).
    #[default]
    Reflect,
    /// Replicate edge values.
    Replicate,
}

/// Pad the last axis of `x` by `left` and `right` samples.
///
/// Works for any rank; the padding is a single gather along the last axis.
pub fn pad_time(x: &Array, left: i32, right: i32, mode: PadMode) -> Result<Array> {
    if left < 0 || right < 0 {
        return Err(VocoderError::Config(format!(
            "negative padding ({left}, {right})"
        )));
    }
    let axis = x.ndim() as i32 - 1;
    if axis < 0 {
        return Err(VocoderError::Shape("cannot pad a scalar".into()));
    }
    let length = x.dim(axis);
    if length == 0 {
        return Err(VocoderError::Shape("cannot pad an empty signal".into()));
    }
    if mode == PadMode::Reflect && (left >= length || right >= length) {
        return Err(VocoderError::Shape(format!(
            "reflect padding ({left}, {right}) needs more than {length} samples"
        )));
    }

    let (head, tail): (Vec<i32>, Vec<i32>) = match mode {
        PadMode::Reflect => (
            (1..=left).rev().collect(),
            (0..right).map(|i| length - 2 - i).collect(),
        ),
        PadMode::Replicate => (vec![0; left as usize], vec![length - 1; right as usize]),
    };
    let indices: Vec<i32> = head.into_iter().chain(0..length).chain(tail).collect();
    let n = indices.len() as i32;
    let indices = Array::from_slice(&indices, &[n]);
    Ok(x.take_axis(&indices, axis)?)
}

/// One STFT resolution with its windowed DFT bases.
#[derive(Debug)]
pub struct MagnitudeStft {
    /// FFT size.
    pub fft_size: i32,
    /// Hop size in samples.
    pub hop_size: i32,
    /// Window length (zero-padded to `fft_size`).
    pub win_length: i32,
    /// Window function.
    pub window: WindowKind,
    /// Windowed cosine basis `[fft_size, fft_size/2 + 1]`.
    cos_basis: Array,
    /// Windowed sine basis `[fft_size, fft_size/2 + 1]`.
    sin_basis: Array,
}

impl MagnitudeStft {
    /// Precompute the bases for one resolution.
    pub fn new(fft_size: i32, hop_size: i32, win_length: i32, window: WindowKind) -> Result<Self> {
        if fft_size <= 0 || hop_size <= 0 {
            return Err(VocoderError::Config(format!(
                "STFT sizes must be positive, got fft={fft_size} hop={hop_size}"
            )));
        }
        if win_length <= 0 {
            return Err(VocoderError::Config(format!(
                "window length must be positive, got {win_length}"
            )));
        }
        let n_fft = fft_size as usize;
        let win = window.padded_coefficients(win_length as usize, n_fft)?;
        let bins = n_fft / 2 + 1;

        let mut cos = Vec::with_capacity(n_fft * bins);
        let mut sin = Vec::with_capacity(n_fft * bins);
        for (n, w) in win.iter().enumerate() {
            for k in 0..bins {
                // Reduce the phase index modulo n_fft to keep the angle small.
                let phase = 2.0 * PI * ((n * k) % n_fft) as f64 / n_fft as f64;
                cos.push(*w * phase.cos() as f32);
                sin.push(-*w * phase.sin() as f32);
            }
        }
        let shape = [fft_size, bins as i32];

        Ok(Self {
            fft_size,
            hop_size,
            win_length,
            window,
            cos_basis: Array::from_slice(&cos, &shape),
            sin_basis: Array::from_slice(&sin, &shape),
        })
    }

    /// Number of frequency bins.
    pub fn num_bins(&self) -> i32 {
        self.fft_size / 2 + 1
    }

    /// Number of frames for a signal of `length` samples.
    pub fn num_frames(&self, length: i32) -> i32 {
        let padded = length + 2 * (self.fft_size / 2);
        (padded - self.fft_size) / self.hop_size + 1
    }

    /// Magnitude spectrogram.
    ///
    /// # Arguments
    /// * `signal` - Audio [batch, samples]
    ///
    /// # Returns
    /// Magnitudes [batch, frames, fft_size/2 + 1]
    pub fn magnitude(&self, signal: &Array) -> Result<Array> {
        if signal.ndim() != 2 {
            return Err(VocoderError::Shape(format!(
                "STFT input must be (batch, samples), got {:?}",
                signal.shape()
            )));
        }
        let batch = signal.dim(0);
        let length = signal.dim(1);
        let pad = self.fft_size / 2;
        let padded = pad_time(signal, pad, pad, PadMode::Reflect)?;

        // Gather all frames at once: [batch, frames * fft_size] -> [batch, frames, fft_size].
        let num_frames = self.num_frames(length);
        let frame_index: Vec<i32> = (0..num_frames)
            .flat_map(|f| {
                let start = f * self.hop_size;
                start..start + self.fft_size
            })
            .collect();
        let frame_index = Array::from_slice(&frame_index, &[num_frames * self.fft_size]);
        let frames = padded
            .take_axis(&frame_index, 1)?
            .reshape(&[batch, num_frames, self.fft_size])?;

        let real = frames.matmul(&self.cos_basis)?;
        let imag = frames.matmul(&self.sin_basis)?;
        let power = real.square()?.add(&imag.square()?)?;
        let power = mlx_rs::ops::maximum(&power, &Array::from_f32(MAGNITUDE_FLOOR))?;
        Ok(power.sqrt()?)
    }
}

//! Analysis window functions.

use crate::error::{Result, VocoderError};
use mlx_rs::Array;
use std::f64::consts::PI;

/// Window functions available to the STFT front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    /// Raised cosine, zero at the edges.
    Hann,
    /// Raised cosine on a 0.08 pedestal.
    Hamming,
    /// Three-term cosine sum.
    Blackman,
    /// Triangle.
    Bartlett,
}

impl WindowKind {
    /// Resolve a window from its configuration name (`hann_window`, ...).
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "hann_window" => Ok(Self::Hann),
            "hamming_window" => Ok(Self::Hamming),
            "blackman_window" => Ok(Self::Blackman),
            "bartlett_window" => Ok(Self::Bartlett),
            other => Err(VocoderError::Config(format!(
                "unsupported window {other:?} (expected hann_window, hamming_window, blackman_window or bartlett_window)"
            ))),
        }
    }

    /// Configuration name of this window.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hann => "hann_window",
            Self::Hamming => "hamming_window",
            Self::Blackman => "blackman_window",
            Self::Bartlett => "bartlett_window",
        }
    }

    /// Periodic window coefficients of length `size`.
    ///
    /// Periodic windows are the first `size` samples of the symmetric window
    /// of length `size + 1`, the form suited to spectral analysis.
    pub fn coefficients(&self, size: usize) -> Vec<f32> {
        if size == 1 {
            return vec![1.0];
        }
        let n_total = size as f64;
        (0..size)
            .map(|n| {
                let phase = 2.0 * PI * n as f64 / n_total;
                let w = match self {
                    Self::Hann => 0.5 - 0.5 * phase.cos(),
                    Self::Hamming => 0.54 - 0.46 * phase.cos(),
                    Self::Blackman => 0.42 - 0.5 * phase.cos() + 0.08 * (2.0 * phase).cos(),
                    Self::Bartlett => 1.0 - (2.0 * n as f64 / n_total - 1.0).abs(),
                };
                w as f32
            })
            .collect()
    }

    /// Coefficients of length `win_length` zero-padded on both sides to
    /// `fft_size`, centred the same way the STFT centres short windows.
    pub fn padded_coefficients(&self, win_length: usize, fft_size: usize) -> Result<Vec<f32>> {
        if win_length == 0 || win_length > fft_size {
            return Err(VocoderError::Config(format!(
                "window length {win_length} must be in 1..={fft_size}"
            )));
        }
        let left = (fft_size - win_length) / 2;
        let mut padded = vec![0.0f32; fft_size];
        padded[left..left + win_length].copy_from_slice(&self.coefficients(win_length));
        Ok(padded)
    }

    /// Padded window as an array of shape `[fft_size]`.
    pub fn array(&self, win_length: usize, fft_size: usize) -> Result<Array> {
        let coeffs = self.padded_coefficients(win_length, fft_size)?;
        Ok(Array::from_slice(&coeffs, &[fft_size as i32]))
    }
}

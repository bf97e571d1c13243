//! Multi-resolution STFT loss.

use crate::audio::{MagnitudeStft, WindowKind};
use crate::config::StftLossConfig;
use crate::error::{Result, VocoderError};
use mlx_rs::Array;

/// Spectral convergence: ‖|Y| − |X|‖_F / ‖|Y|‖_F.
///
/// # Arguments
/// * `x_mag` - Predicted magnitudes [batch, frames, bins]
/// * `y_mag` - Target magnitudes [batch, frames, bins]
pub fn spectral_convergence_loss(x_mag: &Array, y_mag: &Array) -> Result<Array> {
    let numerator = y_mag.subtract(x_mag)?.square()?.sum(None)?.sqrt()?;
    let denominator = y_mag.square()?.sum(None)?.sqrt()?;
    Ok(numerator.divide(&denominator)?)
}

/// Log magnitude distance: mean |log|Y| − log|X||.
pub fn log_stft_magnitude_loss(x_mag: &Array, y_mag: &Array) -> Result<Array> {
    Ok(y_mag.log()?.subtract(&x_mag.log()?)?.abs()?.mean(None)?)
}

/// Spectral losses at a single STFT resolution.
#[derive(Debug)]
pub struct StftLoss {
    stft: MagnitudeStft,
}

impl StftLoss {
    /// Create the loss for one resolution.
    pub fn new(fft_size: i32, hop_size: i32, win_length: i32, window: WindowKind) -> Result<Self> {
        Ok(Self {
            stft: MagnitudeStft::new(fft_size, hop_size, win_length, window)?,
        })
    }

    /// The underlying transform.
    pub fn stft(&self) -> &MagnitudeStft {
        &self.stft
    }

    /// Compute (spectral convergence, log magnitude) for [batch, samples]
    /// signals.
    pub fn forward(&self, x: &Array, y: &Array) -> Result<(Array, Array)> {
        let x_mag = self.stft.magnitude(x)?;
        let y_mag = self.stft.magnitude(y)?;
        let sc = spectral_convergence_loss(&x_mag, &y_mag)?;
        let mag = log_stft_magnitude_loss(&x_mag, &y_mag)?;
        Ok((sc, mag))
    }
}

/// Spectral losses averaged over several STFT resolutions.
///
/// Window coefficients and DFT bases are built once at construction.
#[derive(Debug)]
pub struct MultiResolutionStftLoss {
    /// Loss configuration.
    pub config: StftLossConfig,
    /// One loss per resolution.
    pub losses: Vec<StftLoss>,
}

impl MultiResolutionStftLoss {
    /// Create the loss bank, validating the configuration first.
    pub fn new(config: StftLossConfig) -> Result<Self> {
        config.validate()?;
        let window = config.window_kind()?;
        let losses = config
            .resolutions()
            .map(|(fft, hop, win)| StftLoss::new(fft, hop, win, window))
            .collect::<Result<Vec<_>>>()?;
        tracing::debug!(
            resolutions = losses.len(),
            window = window.name(),
            "built multi-resolution STFT loss"
        );
        Ok(Self { config, losses })
    }

    /// Compute the averaged losses.
    ///
    /// # Arguments
    /// * `x` - Predicted waveform [batch, samples] or [batch, 1, samples]
    /// * `y` - Target waveform with the same shape as `x`
    ///
    /// # Returns
    /// Tuple of (spectral convergence loss, log STFT magnitude loss)
    pub fn forward(&self, x: &Array, y: &Array) -> Result<(Array, Array)> {
        if x.shape() != y.shape() {
            return Err(VocoderError::ShapeMismatch {
                expected: y.shape().to_vec(),
                actual: x.shape().to_vec(),
            });
        }
        let x = squeeze_channel(x)?;
        let y = squeeze_channel(y)?;

        let mut sc_total: Option<Array> = None;
        let mut mag_total: Option<Array> = None;
        for loss in &self.losses {
            let (sc, mag) = loss.forward(&x, &y)?;
            sc_total = Some(match sc_total {
                Some(acc) => acc.add(&sc)?,
                None => sc,
            });
            mag_total = Some(match mag_total {
                Some(acc) => acc.add(&mag)?,
                None => mag,
            });
        }

        let count = Array::from_f32(self.losses.len() as f32);
        match (sc_total, mag_total) {
            (Some(sc), Some(mag)) => Ok((sc.divide(&count)?, mag.divide(&count)?)),
            _ => Err(VocoderError::Config("no STFT resolutions configured".into())),
        }
    }
}

/// Accept [batch, 1, samples] by dropping the channel axis.
fn squeeze_channel(x: &Array) -> Result<Array> {
    match x.ndim() {
        2 => Ok(x.clone()),
        3 if x.dim(1) == 1 => Ok(x.reshape(&[x.dim(0), x.dim(2)])?),
        _ => Err(VocoderError::Shape(format!(
            "STFT loss expects (batch, samples) or (batch, 1, samples), got {:?}",
            x.shape()
        ))),
    }
}

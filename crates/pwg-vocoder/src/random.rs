//! Explicit random source for noise and dropout.
//!
//! Models never touch MLX's global random state. Every draw goes through a
//! [`RandomSource`], which derives a fresh PRNG key from its seed and an
//! internal counter, so two sources built from the same seed produce the same
//! sequence of tensors.

use crate::error::{Result, VocoderError};
use mlx_rs::Array;

/// Seeded, counter-based source of MLX PRNG keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomSource {
    seed: u64,
    counter: u64,
}

impl RandomSource {
    /// Create a source from a seed.
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: 0 }
    }

    /// Seed this source was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Number of keys drawn so far.
    pub fn draws(&self) -> u64 {
        self.counter
    }

    /// Derive the next PRNG key.
    pub fn next_key(&mut self) -> Result<Array> {
        let mixed = splitmix64(self.seed ^ splitmix64(self.counter));
        self.counter += 1;
        Ok(mlx_rs::random::key(mixed)?)
    }

    /// Standard normal samples of the given shape.
    pub fn normal(&mut self, shape: &[i32]) -> Result<Array> {
        let key = self.next_key()?;
        Ok(mlx_rs::random::normal::<f32>(shape, None, None, Some(&key))?)
    }

    /// Uniform samples in `[low, high)` of the given shape.
    pub fn uniform(&mut self, low: f32, high: f32, shape: &[i32]) -> Result<Array> {
        let key = self.next_key()?;
        Ok(mlx_rs::random::uniform::<_, f32>(low, high, shape, Some(&key))?)
    }

    /// Inverted dropout: zero each element with probability `p` and scale the
    /// survivors by `1 / (1 - p)`.
    pub fn dropout(&mut self, x: &Array, p: f32) -> Result<Array> {
        if !(0.0..1.0).contains(&p) {
            return Err(VocoderError::Config(format!("dropout must be in [0, 1), got {p}")));
        }
        if p == 0.0 {
            return Ok(x.clone());
        }
        let keep = self.uniform(0.0, 1.0, x.shape())?.ge(&Array::from_f32(p))?;
        let scale = Array::from_f32(1.0 / (1.0 - p));
        let kept = x.multiply(&scale)?;
        let zeros = mlx_rs::ops::zeros_like(x)?;
        Ok(mlx_rs::ops::r#where(&keep, &kept, &zeros)?)
    }
}

impl Default for RandomSource {
    fn default() -> Self {
        Self::new(0)
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

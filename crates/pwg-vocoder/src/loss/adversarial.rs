//! Least-squares adversarial losses.

use crate::error::Result;
use mlx_rs::Array;

/// Generator adversarial loss.
///
/// L_adv(G) = E[(1 - D(G(z)))²]
///
/// Encourages the generator to produce outputs the discriminator scores as real.
pub fn generator_adversarial_loss(fake_scores: &Array) -> Result<Array> {
    let one = Array::from_f32(1.0);
    let diff = one.subtract(fake_scores)?;
    Ok(diff.square()?.mean(None)?)
}

/// Discriminator adversarial loss.
///
/// L_adv(D) = E[(1 - D(x))²] + E[D(G(z))²]
///
/// Returns the real and fake terms separately so callers can log them.
pub fn discriminator_adversarial_loss(real_scores: &Array, fake_scores: &Array) -> Result<(Array, Array)> {
    let one = Array::from_f32(1.0);
    let real_loss = one.subtract(real_scores)?.square()?.mean(None)?;
    let fake_loss = fake_scores.square()?.mean(None)?;
    Ok((real_loss, fake_loss))
}

//! Gradient utilities: global norm, clipping and finiteness checks.

use mlx_rs::module::FlattenedModuleParam;
use mlx_rs::Array;

use crate::error::{Result, TrainerError};

/// Global L2 norm over every gradient tensor.
pub fn global_norm(grads: &FlattenedModuleParam) -> Result<f32> {
    // Build lazy computation graph: sum of all squared norms
    let mut norm_sq_sum = Array::from_f32(0.0);
    for grad in grads.values() {
        let norm_sq = grad.square()?.sum(None)?;
        norm_sq_sum = norm_sq_sum.add(&norm_sq)?;
    }

    // Single eval() for the whole tree
    norm_sq_sum.eval()?;
    Ok(norm_sq_sum.item::<f32>().sqrt())
}

/// Rescale `grads` in place so their global norm is at most `max_norm`.
///
/// Returns the norm before clipping. `max_norm <= 0` disables clipping but
/// still reports the norm.
pub fn clip_by_global_norm(grads: &mut FlattenedModuleParam, max_norm: f32) -> Result<f32> {
    let total_norm = global_norm(grads)?;
    if max_norm > 0.0 && total_norm > max_norm {
        let scale = Array::from_f32(max_norm / (total_norm + 1e-6));
        for grad in grads.values_mut() {
            *grad = grad.multiply(&scale)?;
        }
    }
    Ok(total_norm)
}

/// Fail with [`TrainerError::NonFinite`] unless `value` is finite.
pub fn ensure_finite(value: f32, what: &str, step: u64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        tracing::warn!(step, what, value, "non-finite value, skipping update");
        Err(TrainerError::NonFinite {
            what: what.to_string(),
            step,
        })
    }
}

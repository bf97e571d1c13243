//! Rectified Adam (RAdam) optimizer.
//!
//! Based on "On the Variance of the Adaptive Learning Rate and Beyond"
//! (Liu et al., 2020). Adam's adaptive learning rate has a large variance in
//! the first steps, when the second-moment estimate has seen few gradients.
//! RAdam estimates the length of the approximated simple moving average and
//! only switches to the variance-normalized update once that estimate makes
//! the variance tractable; before that it takes plain momentum steps.
//!
//! # Algorithm
//!
//! ```text
//! m_t = β₁ m_{t-1} + (1 - β₁) g_t
//! v_t = β₂ v_{t-1} + (1 - β₂) g_t²
//! ρ_∞ = 2 / (1 - β₂) - 1
//! ρ_t = ρ_∞ - 2 t β₂ᵗ / (1 - β₂ᵗ)
//!
//! if ρ_t ≥ 5:
//!     r_t = sqrt((1 - β₂ᵗ) (ρ_t - 4)(ρ_t - 2) ρ_∞ / ((ρ_∞ - 4)(ρ_∞ - 2) ρ_t))
//!     θ_t = θ_{t-1} - η r_t / (1 - β₁ᵗ) · m_t / (√v_t + ε)
//! else:
//!     θ_t = θ_{t-1} - η / (1 - β₁ᵗ) · m_t
//! ```
//!
//! Decoupled weight decay shrinks θ by `η λ θ` before the update.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pwg_trainer::{RAdam, RAdamConfig};
//! use mlx_rs::optimizers::Optimizer;
//!
//! let mut optimizer = RAdam::new(RAdamConfig::default().with_lr(1e-4))?;
//! let (loss, grads) = loss_and_grad_fn(&mut model, batch)?;
//! optimizer.update(&mut model, grads)?;
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::{
    error::Result as MlxResult,
    optimizers::{Optimizer, State},
    utils::Updatable,
    Array,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainerError};

/// ρ_t at or above which the adaptive update is used.
pub const RECTIFICATION_THRESHOLD: f64 = 5.0;

/// Configuration for the RAdam optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RAdamConfig {
    /// Learning rate.
    /// Default: 1e-3
    #[serde(default = "default_lr")]
    pub lr: f32,

    /// Decay rates of the first and second moments.
    /// Default: (0.9, 0.999)
    #[serde(default = "default_betas")]
    pub betas: (f32, f32),

    /// Added to the denominator for numerical stability.
    /// Default: 1e-8
    #[serde(default = "default_eps")]
    pub eps: f32,

    /// Decoupled weight decay coefficient.
    /// Default: 0.0
    #[serde(default)]
    pub weight_decay: f32,
}

fn default_lr() -> f32 {
    1e-3
}
fn default_betas() -> (f32, f32) {
    (0.9, 0.999)
}
fn default_eps() -> f32 {
    1e-8
}

impl Default for RAdamConfig {
    fn default() -> Self {
        Self {
            lr: default_lr(),
            betas: default_betas(),
            eps: default_eps(),
            weight_decay: 0.0,
        }
    }
}

impl RAdamConfig {
    /// Set the learning rate.
    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    /// Set the moment decay rates.
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.betas = (beta1, beta2);
        self
    }

    /// Set epsilon.
    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    /// Set the weight decay coefficient.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(self.lr >= 0.0 && self.lr.is_finite()) {
            return Err(TrainerError::Config(format!("invalid learning rate: {}", self.lr)));
        }
        let (beta1, beta2) = self.betas;
        if !(0.0..1.0).contains(&beta1) {
            return Err(TrainerError::Config(format!("invalid beta1: {beta1}")));
        }
        if !(0.0..1.0).contains(&beta2) {
            return Err(TrainerError::Config(format!("invalid beta2: {beta2}")));
        }
        if !(self.eps > 0.0 && self.eps.is_finite()) {
            return Err(TrainerError::Config(format!("invalid epsilon: {}", self.eps)));
        }
        if !(self.weight_decay >= 0.0 && self.weight_decay.is_finite()) {
            return Err(TrainerError::Config(format!(
                "invalid weight_decay: {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Rectification term for one step count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rectification {
    /// Step count (1-based).
    pub step: u64,
    /// Approximated SMA length ρ_t.
    pub rho_t: f64,
    /// Whether the variance-normalized update applies (ρ_t ≥ 5).
    pub adaptive: bool,
    /// Multiplier on `lr`: r_t / (1 - β₁ᵗ) when adaptive, 1 / (1 - β₁ᵗ) otherwise.
    pub step_size: f64,
}

/// Rectified Adam optimizer.
///
/// Moments and step counts are created lazily the first time each parameter
/// is updated and live as long as the optimizer.
#[derive(Debug, Clone)]
pub struct RAdam {
    config: RAdamConfig,
    /// First and second moments per parameter.
    state: State<(Array, Array)>,
    /// Update count per parameter.
    steps: HashMap<Rc<str>, u64>,
}

impl RAdam {
    /// Create a new optimizer, validating the configuration.
    pub fn new(config: RAdamConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: State::new(),
            steps: HashMap::new(),
        })
    }

    /// Optimizer configuration.
    pub fn config(&self) -> &RAdamConfig {
        &self.config
    }

    /// Current learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.config.lr
    }

    /// Set the learning rate (for external schedules).
    pub fn set_learning_rate(&mut self, lr: f32) -> Result<()> {
        if !(lr >= 0.0 && lr.is_finite()) {
            return Err(TrainerError::Config(format!("invalid learning rate: {lr}")));
        }
        self.config.lr = lr;
        Ok(())
    }

    /// ρ_∞, the maximum SMA length.
    pub fn rho_inf(&self) -> f64 {
        2.0 / (1.0 - self.config.betas.1 as f64) - 1.0
    }

    /// Rectification term at `step` (1-based; 0 is treated as 1).
    pub fn rectification(&self, step: u64) -> Rectification {
        let step = step.max(1);
        let t = step as f64;
        let beta1 = self.config.betas.0 as f64;
        let beta2 = self.config.betas.1 as f64;

        let beta2_t = beta2.powf(t);
        let bias_correction1 = 1.0 - beta1.powf(t);
        let bias_correction2 = 1.0 - beta2_t;

        let rho_inf = self.rho_inf();
        let rho_t = if bias_correction2 > 0.0 {
            rho_inf - 2.0 * t * beta2_t / bias_correction2
        } else {
            // β₂ = 0: the second moment is the last squared gradient.
            rho_inf
        };

        let adaptive = rho_t >= RECTIFICATION_THRESHOLD;
        let step_size = if adaptive {
            let r = (bias_correction2 * (rho_t - 4.0) / (rho_inf - 4.0) * (rho_t - 2.0) / rho_t * rho_inf
                / (rho_inf - 2.0))
                .sqrt();
            r / bias_correction1
        } else {
            1.0 / bias_correction1
        };

        Rectification {
            step,
            rho_t,
            adaptive,
            step_size,
        }
    }

    /// First step count that takes the adaptive update, if any.
    ///
    /// `None` when ρ_∞ < 5, i.e. β₂ is too small for the variance to ever
    /// become tractable.
    pub fn first_adaptive_step(&self) -> Option<u64> {
        if self.rho_inf() < RECTIFICATION_THRESHOLD {
            return None;
        }
        // ρ_t increases monotonically towards ρ_∞.
        (1..).find(|&step| self.rectification(step).adaptive)
    }

    /// Number of updates applied to the parameter `key`.
    pub fn step_count(&self, key: &str) -> u64 {
        self.steps.get(key).copied().unwrap_or(0)
    }

    /// First and second moments of the parameter `key`, if it has been updated.
    pub fn moments(&self, key: &str) -> Option<(&Array, &Array)> {
        self.state.get(key).map(|(m, v)| (m, v))
    }

    /// Drop all moments and step counts.
    pub fn reset_state(&mut self) {
        self.state.clear();
        self.steps.clear();
    }

    /// Keys in a stable order for [`Updatable`].
    fn sorted_keys(&self) -> Vec<Rc<str>> {
        let mut keys: Vec<Rc<str>> = self.state.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Optimizer for RAdam {
    type State = State<(Array, Array)>;

    fn state(&self) -> &Self::State {
        &self.state
    }

    fn state_mut(&mut self) -> &mut Self::State {
        &mut self.state
    }

    fn update_single(&mut self, key: &Rc<str>, gradient: &Array, parameter: &mut Array) -> MlxResult<()> {
        let step = {
            let count = self.steps.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let rect = self.rectification(step);
        let (beta1, beta2) = self.config.betas;
        let lr = self.config.lr;

        let (m, v) = match self.state.entry(key.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let m = mlx_rs::ops::zeros_like(parameter)?;
                let v = mlx_rs::ops::zeros_like(parameter)?;
                entry.insert((m, v))
            }
        };

        // m = β₁ m + (1 - β₁) g, v = β₂ v + (1 - β₂) g²
        let m_new = m
            .multiply(&Array::from_f32(beta1))?
            .add(&gradient.multiply(&Array::from_f32(1.0 - beta1))?)?;
        let v_new = v
            .multiply(&Array::from_f32(beta2))?
            .add(&gradient.square()?.multiply(&Array::from_f32(1.0 - beta2))?)?;

        let decayed = if self.config.weight_decay != 0.0 {
            parameter.multiply(&Array::from_f32(1.0 - self.config.weight_decay * lr))?
        } else {
            parameter.clone()
        };

        let scaled_lr = Array::from_f32((lr as f64 * rect.step_size) as f32);
        let update = if rect.adaptive {
            let denom = v_new.sqrt()?.add(&Array::from_f32(self.config.eps))?;
            m_new.divide(&denom)?.multiply(&scaled_lr)?
        } else {
            m_new.multiply(&scaled_lr)?
        };

        *parameter = decayed.subtract(&update)?;
        *m = m_new;
        *v = v_new;
        Ok(())
    }
}

impl Updatable for RAdam {
    fn updatable_states_len(&self) -> usize {
        self.state.len() * 2
    }

    fn updatable_states(&self) -> impl IntoIterator<Item = &Array> {
        let keys = self.sorted_keys();
        let state = &self.state;
        keys.into_iter()
            .filter_map(move |key| state.get(&key))
            .flat_map(|(m, v)| [m, v])
            .collect::<Vec<_>>()
    }

    fn updatable_states_mut(&mut self) -> impl IntoIterator<Item = &mut Array> {
        let mut entries: Vec<_> = self.state.iter_mut().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().flat_map(|(_, (m, v))| [m, v])
    }
}

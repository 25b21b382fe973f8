//! Optimizer, gradient accumulation and learning-rate schedules
//!
//! AdamW over every encoder parameter, with gradients summed across
//! micro-batches and clipped by global L2 norm before each update.

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};

/// AdamW optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            lr: 2e-5,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// AdamW optimizer wrapper
pub struct AdamW {
    inner: candle_nn::optim::AdamW,
    config: AdamWConfig,
    step_count: usize,
}

impl AdamW {
    pub fn new(vars: Vec<Var>, config: AdamWConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.lr,
            beta1: config.beta1,
            beta2: config.beta2,
            eps: config.eps,
            weight_decay: config.weight_decay,
        };
        let inner = candle_nn::optim::AdamW::new(vars, params)?;

        Ok(Self {
            inner,
            config,
            step_count: 0,
        })
    }

    /// Apply one update from (accumulated, clipped) gradients
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.inner.step(grads)?;
        self.step_count += 1;
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
        self.inner.set_learning_rate(lr);
    }

    pub fn step_count(&self) -> usize {
        self.step_count
    }
}

/// Sums gradients of several micro-batches into one store
pub struct GradientAccumulator {
    vars: Vec<Var>,
    grads: Option<GradStore>,
    micro_batches: usize,
}

impl GradientAccumulator {
    pub fn new(vars: Vec<Var>) -> Self {
        Self {
            vars,
            grads: None,
            micro_batches: 0,
        }
    }

    /// Add the gradients of one backward pass
    pub fn add(&mut self, grads: GradStore) -> Result<()> {
        self.micro_batches += 1;
        let Some(acc) = self.grads.as_mut() else {
            self.grads = Some(grads);
            return Ok(());
        };

        for var in &self.vars {
            let tensor = var.as_tensor();
            let Some(new) = grads.get(tensor) else {
                continue;
            };
            let sum = match acc.get(tensor) {
                Some(old) => (old + new)?,
                None => new.clone(),
            };
            acc.insert(tensor, sum);
        }
        Ok(())
    }

    /// Number of micro-batches added since the last take
    pub fn pending(&self) -> usize {
        self.micro_batches
    }

    /// Take the accumulated gradients, resetting the accumulator
    pub fn take(&mut self) -> Option<GradStore> {
        self.micro_batches = 0;
        self.grads.take()
    }
}

/// Global L2 norm of the gradients of `vars`
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    Ok(total_sq.sqrt())
}

/// Scale gradients so their global norm is at most `max_norm`
///
/// Returns the norm before clipping. A non-positive `max_norm` disables
/// clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = grad_norm(grads, vars)?;
    if max_norm <= 0.0 || total_norm <= max_norm {
        return Ok(total_norm);
    }

    let coef = max_norm / (total_norm + 1e-6);
    tracing::trace!("Clipping gradient norm {:.4} with coef {:.4}", total_norm, coef);
    for var in vars {
        let tensor = var.as_tensor();
        if let Some(grad) = grads.get(tensor) {
            let clipped: Tensor = (grad * coef)?;
            grads.insert(tensor, clipped);
        }
    }
    Ok(total_norm)
}

/// Learning-rate schedule shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    Linear,
    #[default]
    Cosine,
    Constant,
    ConstantWithWarmup,
}

impl std::str::FromStr for SchedulerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            "constant" => Ok(Self::Constant),
            "constant_with_warmup" => Ok(Self::ConstantWithWarmup),
            _ => Err(anyhow::anyhow!(
                "Invalid scheduler: {}. Valid options: linear, cosine, constant, constant_with_warmup",
                s
            )),
        }
    }
}

/// Learning rate scheduler
///
/// `get_lr` is the rate for the next optimizer update; `step` advances after
/// the update. With warmup, the first update runs at rate 0.
pub struct LearningRateScheduler {
    kind: SchedulerKind,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    pub fn new(kind: SchedulerKind, base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            kind,
            base_lr,
            warmup_steps,
            total_steps,
            current_step: 0,
        }
    }

    /// Warmup length for a ratio of the total, rounded up
    pub fn warmup_from_ratio(total_steps: usize, ratio: f64) -> usize {
        (total_steps as f64 * ratio).ceil() as usize
    }

    pub fn get_lr(&self) -> f64 {
        self.base_lr * self.factor(self.current_step)
    }

    fn factor(&self, step: usize) -> f64 {
        let warmup = match self.kind {
            SchedulerKind::Constant => 0,
            _ => self.warmup_steps,
        };
        if step < warmup {
            return step as f64 / warmup.max(1) as f64;
        }

        let decay_steps = self.total_steps.saturating_sub(warmup).max(1) as f64;
        let progress = ((step - warmup) as f64 / decay_steps).min(1.0);
        match self.kind {
            SchedulerKind::Linear => 1.0 - progress,
            SchedulerKind::Cosine => 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
            SchedulerKind::Constant | SchedulerKind::ConstantWithWarmup => 1.0,
        }
    }

    /// Step the scheduler and return the new learning rate
    pub fn step(&mut self) -> f64 {
        self.current_step += 1;
        self.get_lr()
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

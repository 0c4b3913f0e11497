//! First-order optimizers with per-parameter state keyed by parameter name.

use crate::config::{OptimizerConfig, OptimizerKind};
use crate::error::{LenslessError, Result};
use crate::graph::Tensor;
use crate::nn::Parameter;
use ndarray::Zip;
use std::collections::HashMap;
use std::fmt::Debug;

/// State associated with a parameter during optimization.
#[derive(Debug, Clone, Default)]
pub struct ParamState {
    /// First moment (momentum).
    pub momentum_buffer: Option<Tensor>,
    /// Second moment, Adam only.
    pub exp_avg_sq: Option<Tensor>,
    /// Step count for bias correction.
    pub step: usize,
}

pub trait Optimizer: Debug {
    /// Updates `param` from its stored gradient; frozen or gradient-less parameters are skipped.
    fn update(&mut self, param: &mut Parameter);

    fn lr(&self) -> f32;

    fn set_lr(&mut self, lr: f32);

    /// Names of the parameters that have state.
    fn state_names(&self) -> Vec<String>;
}

fn trainable_grad(param: &Parameter) -> Option<Tensor> {
    if !param.requires_grad() {
        return None;
    }
    param.grad().cloned()
}

/// Stochastic gradient descent with optional heavy-ball momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    state: HashMap<String, ParamState>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Sgd {
            lr,
            momentum,
            state: HashMap::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn update(&mut self, param: &mut Parameter) {
        let Some(grad) = trainable_grad(param) else {
            return;
        };
        let direction = if self.momentum > 0.0 {
            let state = self.state.entry(param.name().to_string()).or_default();
            let buffer = match state.momentum_buffer.take() {
                Some(mut buf) => {
                    buf *= self.momentum;
                    buf += &grad;
                    buf
                }
                None => grad,
            };
            state.step += 1;
            state.momentum_buffer = Some(buffer.clone());
            buffer
        } else {
            grad
        };
        param.value_mut().scaled_add(-self.lr, &direction);
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state_names(&self) -> Vec<String> {
        self.state.keys().cloned().collect()
    }
}

/// Adam with bias correction.
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    state: HashMap<String, ParamState>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            state: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn update(&mut self, param: &mut Parameter) {
        let Some(grad) = trainable_grad(param) else {
            return;
        };
        let (beta1, beta2, eps, lr) = (self.beta1, self.beta2, self.eps, self.lr);
        let state = self.state.entry(param.name().to_string()).or_default();
        state.step += 1;
        let m = state
            .momentum_buffer
            .get_or_insert_with(|| Tensor::zeros(grad.raw_dim()));
        Zip::from(&mut *m)
            .and(&grad)
            .for_each(|m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        let v = state
            .exp_avg_sq
            .get_or_insert_with(|| Tensor::zeros(grad.raw_dim()));
        Zip::from(&mut *v)
            .and(&grad)
            .for_each(|v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        let t = state.step as i32;
        let correction1 = 1.0 - beta1.powi(t);
        let correction2 = 1.0 - beta2.powi(t);
        let (m, v) = (&state.momentum_buffer, &state.exp_avg_sq);
        if let (Some(m), Some(v)) = (m, v) {
            Zip::from(param.value_mut())
                .and(m)
                .and(v)
                .for_each(|p, &m, &v| {
                    let m_hat = m / correction1;
                    let v_hat = v / correction2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }

    fn lr(&self) -> f32 {
        self.lr
    }

    fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn state_names(&self) -> Vec<String> {
        self.state.keys().cloned().collect()
    }
}

pub fn build_optimizer(kind: OptimizerKind, lr: f32, momentum: f32) -> Result<Box<dyn Optimizer>> {
    if !(lr > 0.0 && lr.is_finite()) {
        return Err(LenslessError::Configuration(format!(
            "learning rate must be positive, got {lr}"
        )));
    }
    Ok(match kind {
        OptimizerKind::Adam => Box::new(Adam::new(lr)),
        OptimizerKind::Sgd => Box::new(Sgd::new(lr, momentum)),
    })
}

/// Per-epoch learning-rate factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LearningRateSchedule {
    Constant,
    /// `f` for the first epoch, `√f` for the second, then 1.
    SlowStart(f32),
    /// Multiplies by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f32 },
}

impl LearningRateSchedule {
    /// Slow start takes precedence over step decay.
    pub fn from_config(config: &OptimizerConfig) -> Result<Self> {
        if let Some(factor) = config.slow_start {
            if !(factor > 0.0 && factor.is_finite()) {
                return Err(LenslessError::Configuration(format!(
                    "slow_start factor must be positive, got {factor}"
                )));
            }
            return Ok(LearningRateSchedule::SlowStart(factor));
        }
        if let Some(step_size) = config.step {
            if step_size == 0 {
                return Err(LenslessError::Configuration(
                    "step decay period must be at least one epoch".to_string(),
                ));
            }
            return Ok(LearningRateSchedule::Step {
                step_size,
                gamma: config.gamma,
            });
        }
        Ok(LearningRateSchedule::Constant)
    }

    pub fn factor(&self, epoch: usize) -> f32 {
        match *self {
            LearningRateSchedule::Constant => 1.0,
            LearningRateSchedule::SlowStart(f) => match epoch {
                0 => f,
                1 => f.sqrt(),
                _ => 1.0,
            },
            LearningRateSchedule::Step { step_size, gamma } => {
                gamma.powi((epoch / step_size) as i32)
            }
        }
    }
}

//! Optimizers acting on the local shards of a [`FsdpModel`].
//!
//! Each rank updates only the rows of every parameter it owns, so the state
//! tensors are shaped like the local shards and never communicated.

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::fsdp::{FsdpModel, ParamSlot};
use crate::{DistError, Result};

/// Step count and state tensors of one parameter.
#[derive(Clone, Debug, Default)]
pub struct ParamState {
    /// Number of updates applied.
    pub step: u64,
    /// State tensors by name, shaped like the local shard.
    pub tensors: BTreeMap<String, Tensor>,
}

/// Updates parameters from their gradients.
pub trait Optimizer {
    /// Applies one update to every trainable parameter holding a gradient.
    fn step(&mut self, model: &mut FsdpModel) -> Result<()>;

    /// State keyed by parameter fully qualified name.
    fn state(&self) -> &BTreeMap<String, ParamState>;

    /// Replaces the state.
    fn load_state(&mut self, state: BTreeMap<String, ParamState>) -> Result<()>;
}

/// Calls `update` with the local value and gradient of every trainable
/// parameter that has one, then writes the result back.
fn update_params<F>(model: &mut FsdpModel, mut update: F) -> Result<()>
where
    F: FnMut(&str, &Tensor, &Tensor) -> Result<Tensor>,
{
    for fqn in model.param_order().to_vec() {
        match model.slot(&fqn)? {
            ParamSlot::Managed { unit, index } => {
                let handle = model.unit_handle(unit);
                if !handle.params()[index].requires_grad {
                    continue;
                }
                let Some(grad) = handle.grad_local(index)? else {
                    continue;
                };
                let param = handle.param_local(index)?;
                if param.elem_count() == 0 {
                    continue;
                }
                let value = update(&fqn, &param, &grad)?;
                model.unit_handle_mut(unit).set_param_local(index, &value)?;
            }
            ParamSlot::Unmanaged { module, index } => {
                let param = model.unmanaged_param_mut(module, index)?;
                let Some(grad) = param.grad.as_ref().filter(|_| param.requires_grad) else {
                    continue;
                };
                param.data = update(&fqn, &param.data, grad)?;
            }
        }
    }
    Ok(())
}

fn state_tensor(state: &mut ParamState, name: &str, like: &Tensor) -> Result<Tensor> {
    match state.tensors.get(name) {
        Some(tensor) if tensor.dims() == like.dims() => Ok(tensor.clone()),
        Some(tensor) => Err(DistError::Configuration(format!(
            "optimizer state {name} has shape {:?} but the parameter shard has shape {:?}",
            tensor.dims(),
            like.dims()
        ))),
        None => Ok(like.zeros_like()?),
    }
}

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct AdamW {
    /// Learning rate.
    pub learning_rate: f64,
    /// Decay of the first moment.
    pub beta1: f64,
    /// Decay of the second moment.
    pub beta2: f64,
    /// Added to the denominator.
    pub epsilon: f64,
    /// Decoupled weight decay.
    pub weight_decay: f64,
    state: BTreeMap<String, ParamState>,
}

impl AdamW {
    /// Creates the optimizer with betas `(0.9, 0.999)`, epsilon `1e-8` and
    /// no weight decay.
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            state: BTreeMap::new(),
        }
    }

    /// Sets the decay rates of the first and second moment estimates.
    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Sets the term added to the denominator.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Sets the decoupled weight decay.
    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Updates a single tensor under `key` and returns the new value.
    pub fn update_tensor(&mut self, key: &str, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        let grad = grad.to_dtype(param.dtype())?;
        let state = self.state.entry(key.to_string()).or_default();
        let m = state_tensor(state, "exp_avg", param)?;
        let v = state_tensor(state, "exp_avg_sq", param)?;
        state.step += 1;

        let m = (m.affine(self.beta1, 0.0)? + grad.affine(1.0 - self.beta1, 0.0)?)?;
        let v = (v.affine(self.beta2, 0.0)? + grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;
        let bias_correction1 = 1.0 - self.beta1.powi(state.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(state.step as i32);

        let m_hat = m.affine(1.0 / bias_correction1, 0.0)?;
        let denom = v.affine(1.0 / bias_correction2, 0.0)?.sqrt()?.affine(1.0, self.epsilon)?;
        let decayed = param.affine(1.0 - self.learning_rate * self.weight_decay, 0.0)?;
        let value = (decayed - (m_hat / denom)?.affine(self.learning_rate, 0.0)?)?;

        state.tensors.insert("exp_avg".to_string(), m);
        state.tensors.insert("exp_avg_sq".to_string(), v);
        Ok(value)
    }
}

impl Optimizer for AdamW {
    fn step(&mut self, model: &mut FsdpModel) -> Result<()> {
        update_params(model, |fqn, param, grad| self.update_tensor(fqn, param, grad))
    }

    fn state(&self) -> &BTreeMap<String, ParamState> {
        &self.state
    }

    fn load_state(&mut self, state: BTreeMap<String, ParamState>) -> Result<()> {
        self.state = state;
        Ok(())
    }
}

/// Stochastic gradient descent with optional momentum.
#[derive(Debug)]
pub struct Sgd {
    /// Learning rate.
    pub learning_rate: f64,
    /// Momentum factor, `0` disables the buffer.
    pub momentum: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
    state: BTreeMap<String, ParamState>,
}

impl Sgd {
    /// Plain SGD with `learning_rate`.
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            weight_decay: 0.0,
            state: BTreeMap::new(),
        }
    }

    /// Sets the momentum factor.
    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }

    /// Sets the L2 penalty added to the gradient.
    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    /// Updates a single tensor under `key` and returns the new value.
    pub fn update_tensor(&mut self, key: &str, param: &Tensor, grad: &Tensor) -> Result<Tensor> {
        let mut grad = grad.to_dtype(param.dtype())?;
        if self.weight_decay != 0.0 {
            grad = (grad + param.affine(self.weight_decay, 0.0)?)?;
        }
        let state = self.state.entry(key.to_string()).or_default();
        if self.momentum != 0.0 {
            grad = match state.tensors.get("momentum_buffer") {
                Some(buffer) => (buffer.affine(self.momentum, 0.0)? + grad)?,
                None => grad,
            };
            state.tensors.insert("momentum_buffer".to_string(), grad.clone());
        }
        state.step += 1;
        Ok((param - grad.affine(self.learning_rate, 0.0)?)?)
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &mut FsdpModel) -> Result<()> {
        update_params(model, |fqn, param, grad| self.update_tensor(fqn, param, grad))
    }

    fn state(&self) -> &BTreeMap<String, ParamState> {
        &self.state
    }

    fn load_state(&mut self, state: BTreeMap<String, ParamState>) -> Result<()> {
        self.state = state;
        Ok(())
    }
}

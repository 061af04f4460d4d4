use std::collections::HashMap;

use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::Optimizer;

// ---------------------------------------------------------------------------
// Adam with named, checkpointable moments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

struct Slot {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

/// Adam without weight decay. Every parameter carries a name so the first
/// and second moments can be written to and restored from a checkpoint.
pub struct Adam {
    slots: Vec<Slot>,
    step_t: usize,
    params: ParamsAdam,
}

impl Adam {
    pub fn with_names(vars: Vec<(String, Var)>, params: ParamsAdam) -> Result<Self> {
        let mut slots = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            if !var.dtype().is_float() {
                continue;
            }
            let m = Var::zeros(var.shape(), var.dtype(), var.device())?;
            let v = Var::zeros(var.shape(), var.dtype(), var.device())?;
            slots.push(Slot { name, var, m, v });
        }
        Ok(Self {
            slots,
            step_t: 0,
            params,
        })
    }

    pub fn step_count(&self) -> usize {
        self.step_t
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    /// Update from gradients keyed by parameter name. Parameters without an
    /// entry are left untouched, moments included.
    pub fn step_named(&mut self, grads: &HashMap<String, Tensor>) -> Result<()> {
        self.apply(|slot| grads.get(&slot.name).cloned())
            .map_err(Into::into)
    }

    /// Nothing is written unless every updated parameter is finite.
    fn apply(&mut self, grad_of: impl Fn(&Slot) -> Option<Tensor>) -> candle_core::Result<()> {
        let ParamsAdam { lr, beta1, beta2, eps } = self.params;
        let t = self.step_t + 1;
        let scale_m = 1.0 / (1.0 - beta1.powi(t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(t as i32));
        let mut pending = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            let Some(g) = grad_of(slot) else { continue };
            let next_m = ((slot.m.as_tensor() * beta1)? + (&g * (1.0 - beta1))?)?;
            let next_v = ((slot.v.as_tensor() * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let m_hat = (&next_m * scale_m)?;
            let v_hat = (&next_v * scale_v)?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next_theta = (slot.var.as_tensor() - (update * lr)?)?;
            if !all_finite(&next_theta)? {
                return Err(candle_core::Error::Msg(format!(
                    "parameter {} is not finite after the update",
                    slot.name
                )));
            }
            pending.push((slot, next_m, next_v, next_theta));
        }
        for (slot, next_m, next_v, next_theta) in pending {
            slot.m.set(&next_m)?;
            slot.v.set(&next_v)?;
            slot.var.set(&next_theta)?;
        }
        self.step_t = t;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Checkpoint state
    // -----------------------------------------------------------------------

    /// Moments keyed `m.<name>` / `v.<name>`.
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut out = HashMap::with_capacity(2 * self.slots.len());
        for slot in &self.slots {
            out.insert(format!("m.{}", slot.name), slot.m.as_tensor().clone());
            out.insert(format!("v.{}", slot.name), slot.v.as_tensor().clone());
        }
        out
    }

    /// Restore moments written by [`Adam::state_tensors`]. Every slot must be
    /// present with a matching shape.
    pub fn load_state_tensors(&mut self, state: &HashMap<String, Tensor>, step_t: usize) -> Result<()> {
        for slot in &self.slots {
            for (kind, moment) in [("m", &slot.m), ("v", &slot.v)] {
                let key = format!("{kind}.{}", slot.name);
                let saved = state
                    .get(&key)
                    .ok_or_else(|| anyhow::anyhow!("optimizer state is missing {key}"))?;
                anyhow::ensure!(
                    saved.shape() == moment.shape(),
                    "optimizer state {key} has shape {:?}, expected {:?}",
                    saved.dims(),
                    moment.dims()
                );
                moment.set(&saved.to_dtype(moment.dtype())?)?;
            }
        }
        self.step_t = step_t;
        Ok(())
    }
}

fn all_finite(t: &Tensor) -> candle_core::Result<bool> {
    let total = t.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
    Ok(total.is_finite())
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> candle_core::Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("param{i}"), v))
            .collect();
        Self::with_names(named, params).map_err(|e| candle_core::Error::Msg(e.to_string()))
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        self.apply(|slot| grads.get(slot.var.as_tensor()).cloned())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

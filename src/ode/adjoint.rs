//! Adjoint sensitivity method.
//!
//! For `dz/dt = f(t, z; θ)` and a loss `L(z(t_0), .., z(t_N))`, the adjoint
//! `a(t) = ∂L/∂z(t)` obeys `da/dt = -aᵀ ∂f/∂z`, and
//! `∂L/∂θ = ∫ aᵀ ∂f/∂θ dt` over `[t_0, t_N]`. Both are obtained by solving the
//! augmented state `[z, a, g]` backward from `t_N` to `t_0`, with
//! `dg/dt = -aᵀ ∂f/∂θ` and `g(t_N) = 0`. At every requested time `t_i` the
//! state is re-anchored to the forward solution and `∂L/∂z(t_i)` is added
//! to `a`.
//!
//! The forward pass stores only the states at the requested times, so memory
//! does not grow with the number of solver steps.

use anyhow::Result;
use candle_core::{Shape, Tensor, Var};

use super::{integrate, OdeFunc, OdeOptions, SolverStats};

/// Forward solution produced without an autograd graph.
pub struct AdjointSolution {
    /// Detached states, shape `(len(ts), ..z0.shape)`.
    pub ys: Tensor,
    pub stats: SolverStats,
    ts: Vec<f64>,
}

/// Gradients from the backward adjoint solve.
pub struct AdjointGrads {
    pub grad_z0: Tensor,
    /// One gradient per parameter, in the order the parameters were given.
    pub grad_params: Vec<Tensor>,
    pub stats: SolverStats,
}

/// Forward solve for the adjoint method. Nothing here is tracked by autograd;
/// call [`AdjointSolution::backward`] with `∂L/∂ys` to obtain gradients.
pub fn odeint_adjoint(
    func: &dyn OdeFunc,
    z0: &Tensor,
    ts: &[f64],
    opts: &OdeOptions,
) -> Result<AdjointSolution> {
    let sol = integrate(func, z0, ts, opts, true)?;
    Ok(AdjointSolution {
        ys: sol.ys,
        stats: sol.stats,
        ts: ts.to_vec(),
    })
}

impl AdjointSolution {
    pub fn times(&self) -> &[f64] {
        &self.ts
    }

    /// Solve the adjoint system backward. `params` are the trainable
    /// variables of `func`; `grad_ys` has the shape of `ys`.
    pub fn backward(
        &self,
        func: &dyn OdeFunc,
        params: &[Var],
        grad_ys: &Tensor,
        opts: &OdeOptions,
    ) -> Result<AdjointGrads> {
        anyhow::ensure!(
            grad_ys.dims() == self.ys.dims(),
            "adjoint gradient shape {:?} does not match trajectory shape {:?}",
            grad_ys.dims(),
            self.ys.dims()
        );
        let grad_ys = grad_ys.detach();
        let n_times = self.ts.len();
        let z_shape = self.ys.get(0)?.shape().clone();
        let aug = AugmentedDynamics::new(func, params, z_shape.clone());

        let mut stats = SolverStats::default();
        let mut adj = grad_ys.get(n_times - 1)?;
        let mut param_acc = Tensor::zeros(aug.n_params, self.ys.dtype(), self.ys.device())?;

        for i in (1..n_times).rev() {
            let state = Tensor::cat(
                &[
                    self.ys.get(i)?.flatten_all()?,
                    adj.flatten_all()?,
                    param_acc.clone(),
                ],
                0,
            )?;
            let sol = integrate(&aug, &state, &[self.ts[i], self.ts[i - 1]], opts, true)?;
            stats.nfe += sol.stats.nfe;
            stats.accepted_steps += sol.stats.accepted_steps;
            stats.rejected_steps += sol.stats.rejected_steps;

            let end = sol.ys.get(1)?;
            let n = aug.n_state;
            adj = (end.narrow(0, n, n)?.reshape(z_shape.clone())? + grad_ys.get(i - 1)?)?;
            param_acc = end.narrow(0, 2 * n, aug.n_params)?;
        }

        let grad_params = aug.split_params(&param_acc)?;
        Ok(AdjointGrads {
            grad_z0: adj,
            grad_params,
            stats,
        })
    }
}

// ---------------------------------------------------------------------------
// Augmented dynamics
// ---------------------------------------------------------------------------

/// Dynamics of the flat state `[z, a, g]`, evaluated with one vector-Jacobian
/// product per call.
struct AugmentedDynamics<'a> {
    func: &'a dyn OdeFunc,
    params: &'a [Var],
    z_shape: Shape,
    n_state: usize,
    n_params: usize,
}

impl<'a> AugmentedDynamics<'a> {
    fn new(func: &'a dyn OdeFunc, params: &'a [Var], z_shape: Shape) -> Self {
        let n_state = z_shape.elem_count();
        let n_params = params.iter().map(|p| p.elem_count()).sum();
        Self {
            func,
            params,
            z_shape,
            n_state,
            n_params,
        }
    }

    fn split_params(&self, flat: &Tensor) -> Result<Vec<Tensor>> {
        let mut out = Vec::with_capacity(self.params.len());
        let mut offset = 0;
        for p in self.params {
            let n = p.elem_count();
            out.push(flat.narrow(0, offset, n)?.reshape(p.shape())?);
            offset += n;
        }
        Ok(out)
    }
}

impl OdeFunc for AugmentedDynamics<'_> {
    fn eval(&self, t: f64, state: &Tensor) -> Result<Tensor> {
        let n = self.n_state;
        let z = state.narrow(0, 0, n)?.reshape(self.z_shape.clone())?;
        let adj = state.narrow(0, n, n)?.reshape(self.z_shape.clone())?.detach();

        let z_var = Var::from_tensor(&z.detach())?;
        let f = self.func.eval(t, z_var.as_tensor())?;
        let grads = (&f * &adj)?.sum_all()?.backward()?;

        let vjp_z = match grads.get(z_var.as_tensor()) {
            Some(g) => g.clone(),
            None => z.zeros_like()?,
        };
        let mut parts = Vec::with_capacity(2 + self.params.len());
        parts.push(f.detach().flatten_all()?);
        parts.push(vjp_z.neg()?.flatten_all()?);
        for p in self.params {
            let g = match grads.get(p.as_tensor()) {
                Some(g) => g.neg()?,
                None => p.as_tensor().zeros_like()?,
            };
            parts.push(g.flatten_all()?);
        }
        Tensor::cat(&parts, 0).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::{odeint, ClosureOde};
    use candle_core::{DType, Device};

    /// dz/dt = z @ w, with w a trainable variable.
    fn linear_dynamics(w: &Var) -> ClosureOde<impl Fn(f64, &Tensor) -> Result<Tensor> + '_> {
        ClosureOde::new(move |_t, z: &Tensor| z.matmul(w.as_tensor()).map_err(Into::into))
    }

    #[test]
    fn test_adjoint_matches_backprop() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[[-0.5f32, 0.3], [-0.2, -0.1]], &device)?)?;
        let z0 = Var::from_tensor(&Tensor::new(&[[1.0f32, -1.0], [0.5, 2.0]], &device)?)?;
        let ts = [0.0, 0.4, 0.9, 1.5];
        let opts = OdeOptions::rk4(0.01);
        let target = Tensor::ones((4, 2, 2), DType::F32, &device)?;

        // Reference: back-propagate through the solver.
        let direct = odeint(&linear_dynamics(&w), z0.as_tensor(), &ts, &opts)?;
        let loss = (direct.ys - &target)?.sqr()?.sum_all()?;
        let grads = loss.backward()?;
        let ref_w = grads.get(w.as_tensor()).expect("w grad").flatten_all()?.to_vec1::<f32>()?;
        let ref_z0 = grads.get(z0.as_tensor()).expect("z0 grad").flatten_all()?.to_vec1::<f32>()?;

        // Adjoint.
        let func = linear_dynamics(&w);
        let sol = odeint_adjoint(&func, z0.as_tensor(), &ts, &opts)?;
        let grad_ys = ((&sol.ys - &target)? * 2.0)?;
        let adj = sol.backward(&func, &[w.clone()], &grad_ys, &opts)?;
        let adj_w = adj.grad_params[0].flatten_all()?.to_vec1::<f32>()?;
        let adj_z0 = adj.grad_z0.flatten_all()?.to_vec1::<f32>()?;

        for (a, b) in adj_w.iter().zip(&ref_w) {
            assert!((a - b).abs() < 1e-3 * b.abs().max(1.0), "dL/dw: adjoint {a} vs direct {b}");
        }
        for (a, b) in adj_z0.iter().zip(&ref_z0) {
            assert!((a - b).abs() < 1e-3 * b.abs().max(1.0), "dL/dz0: adjoint {a} vs direct {b}");
        }
        assert!(adj.stats.nfe > 0);
        Ok(())
    }

    #[test]
    fn test_forward_solution_is_detached() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[[0.1f32]], &device)?)?;
        let z0 = Var::from_tensor(&Tensor::new(&[[1.0f32]], &device)?)?;
        let sol = odeint_adjoint(&linear_dynamics(&w), z0.as_tensor(), &[0.0, 1.0], &OdeOptions::rk4(0.1))?;
        let grads = sol.ys.sum_all()?.backward()?;
        assert!(grads.get(w.as_tensor()).is_none());
        assert!(grads.get(z0.as_tensor()).is_none());
        assert_eq!(sol.times(), &[0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_single_time_point_passes_gradient_through() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[[0.1f32]], &device)?)?;
        let z0 = Tensor::new(&[[1.0f32]], &device)?;
        let func = linear_dynamics(&w);
        let opts = OdeOptions::rk4(0.1);
        let sol = odeint_adjoint(&func, &z0, &[0.0], &opts)?;
        let g = Tensor::new(&[[[3.0f32]]], &device)?;
        let adj = sol.backward(&func, &[w.clone()], &g, &opts)?;
        assert_eq!(adj.grad_z0.flatten_all()?.to_vec1::<f32>()?, vec![3.0]);
        assert_eq!(adj.grad_params[0].flatten_all()?.to_vec1::<f32>()?, vec![0.0]);
        Ok(())
    }

    #[test]
    fn test_gradient_shape_mismatch_rejected() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::from_tensor(&Tensor::new(&[[0.1f32]], &device)?)?;
        let func = linear_dynamics(&w);
        let opts = OdeOptions::rk4(0.1);
        let sol = odeint_adjoint(&func, &Tensor::new(&[[1.0f32]], &device)?, &[0.0, 1.0], &opts)?;
        let wrong = Tensor::zeros((3, 1, 1), DType::F32, &device)?;
        assert!(sol.backward(&func, &[w.clone()], &wrong, &opts).is_err());
        Ok(())
    }
}

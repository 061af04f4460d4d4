//! ODE integration over candle tensors.
//!
//! Two entry points:
//!
//! - [`odeint`]: integrates and keeps the autograd graph through every solver
//!   step, so gradients reach `z0` and the dynamics parameters by plain
//!   back-propagation.
//! - [`odeint_adjoint`]: integrates without a graph and computes gradients by
//!   solving the adjoint system backward in time.
//!
//! Both accept a strictly increasing or strictly decreasing time grid and
//! return one state per requested time, in the order given.

mod adjoint;
mod dopri5;
mod fixed;

pub use adjoint::{odeint_adjoint, AdjointGrads, AdjointSolution};

use anyhow::Result;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dynamics
// ---------------------------------------------------------------------------

/// Right-hand side `dz/dt = f(t, z)`.
///
/// Implementations must be pure maps from `(t, z)` to `dz/dt`: the solver
/// may call them at arbitrary intermediate times, in any order.
pub trait OdeFunc {
    fn eval(&self, t: f64, z: &Tensor) -> Result<Tensor>;
}

/// Closure-backed dynamics.
pub struct ClosureOde<F>
where
    F: Fn(f64, &Tensor) -> Result<Tensor>,
{
    func: F,
}

impl<F> ClosureOde<F>
where
    F: Fn(f64, &Tensor) -> Result<Tensor>,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> OdeFunc for ClosureOde<F>
where
    F: Fn(f64, &Tensor) -> Result<Tensor>,
{
    fn eval(&self, t: f64, z: &Tensor) -> Result<Tensor> {
        (self.func)(t, z)
    }
}

// ---------------------------------------------------------------------------
// Options + stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverKind {
    Euler,
    Rk4,
    /// Adaptive Dormand-Prince 5(4).
    Dopri5,
}

impl SolverKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Euler => "euler",
            Self::Rk4 => "rk4",
            Self::Dopri5 => "dopri5",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdeOptions {
    pub method: SolverKind,
    pub rtol: f64,
    pub atol: f64,
    /// Upper bound on the step size of the fixed-step methods.
    pub step_size: f64,
    /// Bound on solver steps (accepted + rejected) per solve.
    pub max_steps: usize,
}

impl Default for OdeOptions {
    fn default() -> Self {
        Self {
            method: SolverKind::Dopri5,
            rtol: 1e-5,
            atol: 1e-6,
            step_size: 0.01,
            max_steps: 100_000,
        }
    }
}

impl OdeOptions {
    pub fn rk4(step_size: f64) -> Self {
        Self {
            method: SolverKind::Rk4,
            step_size,
            ..Self::default()
        }
    }

    pub fn dopri5(rtol: f64, atol: f64) -> Self {
        Self {
            method: SolverKind::Dopri5,
            rtol,
            atol,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.rtol > 0.0 && self.atol > 0.0,
            "tolerances must be positive (rtol={}, atol={})",
            self.rtol,
            self.atol
        );
        anyhow::ensure!(
            self.step_size.is_finite() && self.step_size > 0.0,
            "step_size must be positive, got {}",
            self.step_size
        );
        anyhow::ensure!(self.max_steps > 0, "max_steps must be positive");
        Ok(())
    }
}

/// Work done by one solve. `nfe` counts dynamics evaluations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SolverStats {
    pub nfe: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
}

impl SolverStats {
    pub fn total_steps(&self) -> usize {
        self.accepted_steps + self.rejected_steps
    }
}

/// States at the requested times, shape `(len(ts), ..z0.shape)`.
pub struct OdeSolution {
    pub ys: Tensor,
    pub stats: SolverStats,
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

/// Integrate `func` from `z0` through `ts`, keeping the autograd graph.
pub fn odeint(
    func: &dyn OdeFunc,
    z0: &Tensor,
    ts: &[f64],
    opts: &OdeOptions,
) -> Result<OdeSolution> {
    integrate(func, z0, ts, opts, false)
}

/// Shared driver. With `detach` set, every stored state is cut from the graph.
pub(crate) fn integrate(
    func: &dyn OdeFunc,
    z0: &Tensor,
    ts: &[f64],
    opts: &OdeOptions,
    detach: bool,
) -> Result<OdeSolution> {
    check_time_grid(ts)?;
    let mut stats = SolverStats::default();
    let mut z = if detach { z0.detach() } else { z0.clone() };
    let mut states = Vec::with_capacity(ts.len());
    states.push(z.clone());

    let mut carried_step: Option<f64> = None;
    for window in ts.windows(2) {
        let (t0, t1) = (window[0], window[1]);
        z = match opts.method {
            SolverKind::Euler => fixed::euler_interval(func, &z, t0, t1, opts, &mut stats)?,
            SolverKind::Rk4 => fixed::rk4_interval(func, &z, t0, t1, opts, &mut stats)?,
            SolverKind::Dopri5 => {
                dopri5::dopri5_interval(func, &z, t0, t1, opts, &mut carried_step, &mut stats)?
            }
        };
        if detach {
            z = z.detach();
        }
        states.push(z.clone());
    }

    let ys = Tensor::stack(&states, 0)?;
    Ok(OdeSolution { ys, stats })
}

/// The grid must be non-empty, finite and strictly monotone in one direction.
pub fn check_time_grid(ts: &[f64]) -> Result<()> {
    anyhow::ensure!(!ts.is_empty(), "time grid is empty");
    anyhow::ensure!(
        ts.iter().all(|t| t.is_finite()),
        "time grid contains non-finite values"
    );
    if ts.len() < 2 {
        return Ok(());
    }
    let increasing = ts.windows(2).all(|w| w[1] > w[0]);
    let decreasing = ts.windows(2).all(|w| w[1] < w[0]);
    anyhow::ensure!(
        increasing || decreasing,
        "time grid must be strictly increasing or strictly decreasing"
    );
    Ok(())
}

pub(crate) fn eval_counted(
    func: &dyn OdeFunc,
    t: f64,
    z: &Tensor,
    stats: &mut SolverStats,
) -> Result<Tensor> {
    stats.nfe += 1;
    func.eval(t, z)
}

/// `z + h * sum(c_i * k_i)`
pub(crate) fn combine(z: &Tensor, h: f64, terms: &[(f64, &Tensor)]) -> Result<Tensor> {
    let mut acc = z.clone();
    for &(c, k) in terms {
        if c != 0.0 {
            acc = (acc + (k * (h * c))?)?;
        }
    }
    Ok(acc)
}

/// Root-mean-square of `x / (atol + rtol * max(|a|, |b|))`.
pub(crate) fn scaled_rms(x: &Tensor, a: &Tensor, b: &Tensor, rtol: f64, atol: f64) -> Result<f64> {
    let x = x.detach();
    let scale = ((a.detach().abs()?.maximum(&b.detach().abs()?)? * rtol)? + atol)?;
    let ratio = (x / scale)?;
    let rms = ratio
        .sqr()?
        .mean_all()?
        .sqrt()?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok(rms)
}

//! Fixed-step methods. Each interval `[t0, t1]` is split into the fewest
//! equal substeps no longer than `opts.step_size`, so requested times are hit
//! exactly.

use anyhow::Result;
use candle_core::Tensor;

use super::{combine, eval_counted, OdeFunc, OdeOptions, SolverStats};

fn substeps(t0: f64, t1: f64, opts: &OdeOptions, stats: &SolverStats) -> Result<(usize, f64)> {
    let span = t1 - t0;
    let n = (span.abs() / opts.step_size).ceil().max(1.0) as usize;
    anyhow::ensure!(
        stats.total_steps() + n <= opts.max_steps,
        "fixed-step solve over [{t0}, {t1}] needs more than max_steps={} steps",
        opts.max_steps
    );
    Ok((n, span / n as f64))
}

pub(super) fn euler_interval(
    func: &dyn OdeFunc,
    z: &Tensor,
    t0: f64,
    t1: f64,
    opts: &OdeOptions,
    stats: &mut SolverStats,
) -> Result<Tensor> {
    let (n, h) = substeps(t0, t1, opts, stats)?;
    let mut z = z.clone();
    for i in 0..n {
        let t = t0 + h * i as f64;
        let k = eval_counted(func, t, &z, stats)?;
        z = combine(&z, h, &[(1.0, &k)])?;
        stats.accepted_steps += 1;
    }
    Ok(z)
}

/// Classic fourth-order Runge-Kutta.
///
/// ```text
/// k1 = f(t, z)
/// k2 = f(t + h/2, z + h/2 * k1)
/// k3 = f(t + h/2, z + h/2 * k2)
/// k4 = f(t + h, z + h * k3)
/// z' = z + h/6 * (k1 + 2*k2 + 2*k3 + k4)
/// ```
pub(super) fn rk4_interval(
    func: &dyn OdeFunc,
    z: &Tensor,
    t0: f64,
    t1: f64,
    opts: &OdeOptions,
    stats: &mut SolverStats,
) -> Result<Tensor> {
    let (n, h) = substeps(t0, t1, opts, stats)?;
    let mut z = z.clone();
    for i in 0..n {
        let t = t0 + h * i as f64;
        let k1 = eval_counted(func, t, &z, stats)?;
        let k2 = eval_counted(func, t + h / 2.0, &combine(&z, h / 2.0, &[(1.0, &k1)])?, stats)?;
        let k3 = eval_counted(func, t + h / 2.0, &combine(&z, h / 2.0, &[(1.0, &k2)])?, stats)?;
        let k4 = eval_counted(func, t + h, &combine(&z, h, &[(1.0, &k3)])?, stats)?;
        z = combine(
            &z,
            h / 6.0,
            &[(1.0, &k1), (2.0, &k2), (2.0, &k3), (1.0, &k4)],
        )?;
        stats.accepted_steps += 1;
    }
    Ok(z)
}

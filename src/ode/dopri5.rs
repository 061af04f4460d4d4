//! Adaptive Dormand-Prince 5(4).
//!
//! Fifth-order solution with an embedded fourth-order error estimate. Steps
//! are clipped so that every requested output time is hit exactly, which
//! avoids interpolation between solver steps.

use anyhow::Result;
use candle_core::Tensor;

use super::{combine, eval_counted, scaled_rms, OdeFunc, OdeOptions, SolverStats};

const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;

const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th order weights (also the FSAL stage)
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 5th minus 4th order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;
const ORDER: i32 = 5;

struct StepResult {
    z_new: Tensor,
    err: Tensor,
    /// f(t + h, z_new), reused as k1 of the next step.
    k7: Tensor,
}

fn step(
    func: &dyn OdeFunc,
    t: f64,
    z: &Tensor,
    k1: &Tensor,
    h: f64,
    stats: &mut SolverStats,
) -> Result<StepResult> {
    let k2 = eval_counted(func, t + C2 * h, &combine(z, h, &[(A21, k1)])?, stats)?;
    let k3 = eval_counted(func, t + C3 * h, &combine(z, h, &[(A31, k1), (A32, &k2)])?, stats)?;
    let k4 = eval_counted(
        func,
        t + C4 * h,
        &combine(z, h, &[(A41, k1), (A42, &k2), (A43, &k3)])?,
        stats,
    )?;
    let k5 = eval_counted(
        func,
        t + C5 * h,
        &combine(z, h, &[(A51, k1), (A52, &k2), (A53, &k3), (A54, &k4)])?,
        stats,
    )?;
    let k6 = eval_counted(
        func,
        t + h,
        &combine(z, h, &[(A61, k1), (A62, &k2), (A63, &k3), (A64, &k4), (A65, &k5)])?,
        stats,
    )?;
    let z_new = combine(z, h, &[(B1, k1), (B3, &k3), (B4, &k4), (B5, &k5), (B6, &k6)])?;
    let k7 = eval_counted(func, t + h, &z_new, stats)?;

    let zero = z.zeros_like()?;
    let err = combine(
        &zero,
        h,
        &[(E1, k1), (E3, &k3), (E4, &k4), (E5, &k5), (E6, &k6), (E7, &k7)],
    )?;
    Ok(StepResult { z_new, err, k7 })
}

fn next_step_size(h: f64, err_norm: f64) -> f64 {
    if err_norm == 0.0 {
        return h * MAX_FACTOR;
    }
    let factor = SAFETY * err_norm.powf(-1.0 / ORDER as f64);
    h * factor.clamp(MIN_FACTOR, MAX_FACTOR)
}

/// Hairer, Norsett & Wanner's starting step heuristic.
fn initial_step(
    func: &dyn OdeFunc,
    t0: f64,
    z0: &Tensor,
    f0: &Tensor,
    direction: f64,
    opts: &OdeOptions,
    stats: &mut SolverStats,
) -> Result<f64> {
    let z0 = z0.detach();
    let f0 = f0.detach();
    let d0 = scaled_rms(&z0, &z0, &z0, opts.rtol, opts.atol)?;
    let d1 = scaled_rms(&f0, &z0, &z0, opts.rtol, opts.atol)?;
    let h0 = if d0 < 1e-5 || d1 < 1e-5 { 1e-6 } else { 0.01 * d0 / d1 };

    let z1 = combine(&z0, direction * h0, &[(1.0, &f0)])?;
    let f1 = eval_counted(func, t0 + direction * h0, &z1, stats)?.detach();
    let d2 = scaled_rms(&(f1 - &f0)?, &z0, &z0, opts.rtol, opts.atol)? / h0;

    let h1 = if d1.max(d2) <= 1e-15 {
        (h0 * 1e-3).max(1e-6)
    } else {
        (0.01 / d1.max(d2)).powf(1.0 / ORDER as f64)
    };
    Ok((100.0 * h0).min(h1))
}

/// Advance `z` from `t0` to exactly `t1`. `carried_step` holds the step size
/// proposed at the end of the previous interval.
pub(super) fn dopri5_interval(
    func: &dyn OdeFunc,
    z: &Tensor,
    t0: f64,
    t1: f64,
    opts: &OdeOptions,
    carried_step: &mut Option<f64>,
    stats: &mut SolverStats,
) -> Result<Tensor> {
    let direction = (t1 - t0).signum();
    let span = (t1 - t0).abs();
    let mut t = t0;
    let mut z = z.clone();
    let mut k1 = eval_counted(func, t, &z, stats)?;
    let mut h = match *carried_step {
        Some(h) => h,
        None => initial_step(func, t0, &z, &k1, direction, opts, stats)?,
    };

    let mut remaining = span;
    while remaining > 0.0 {
        anyhow::ensure!(
            stats.total_steps() < opts.max_steps,
            "dopri5 exceeded max_steps={} before reaching t={t1} (stuck at t={t})",
            opts.max_steps
        );
        let last = h >= remaining;
        let h_used = if last { remaining } else { h };
        let res = step(func, t, &z, &k1, direction * h_used, stats)?;
        let err_norm = scaled_rms(&res.err, &z, &res.z_new, opts.rtol, opts.atol)?;
        anyhow::ensure!(
            err_norm.is_finite(),
            "dopri5 error estimate is not finite at t={t} (h={h_used:e})"
        );

        if err_norm <= 1.0 {
            stats.accepted_steps += 1;
            if last {
                t = t1;
                remaining = 0.0;
            } else {
                t += direction * h_used;
                remaining = (t1 - t).abs();
            }
            z = res.z_new;
            k1 = res.k7;
        } else {
            stats.rejected_steps += 1;
        }

        h = next_step_size(h_used, err_norm);
        anyhow::ensure!(
            h > f64::EPSILON * t.abs().max(1.0),
            "dopri5 step size underflow at t={t} (h={h:e})"
        );
    }

    *carried_step = Some(h);
    Ok(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ode::ClosureOde;
    use candle_core::Device;

    #[test]
    fn test_step_size_control() {
        assert_eq!(next_step_size(0.1, 0.0), 0.1 * MAX_FACTOR);
        // Huge errors shrink by at most MIN_FACTOR.
        assert!((next_step_size(0.1, 1e12) - 0.1 * MIN_FACTOR).abs() < 1e-15);
        // An error of exactly one keeps the step near SAFETY * h.
        assert!((next_step_size(0.1, 1.0) - 0.1 * SAFETY).abs() < 1e-12);
    }

    #[test]
    fn test_harmonic_oscillator_period() -> Result<()> {
        // z = (x, v), x'' = -x: after one period the state returns to start.
        let device = Device::Cpu;
        let rot = Tensor::new(&[[0.0f32, -1.0], [1.0, 0.0]], &device)?;
        let f = ClosureOde::new(move |_t, z: &Tensor| z.matmul(&rot).map_err(Into::into));
        let z0 = Tensor::new(&[[1.0f32, 0.0]], &device)?;
        let opts = OdeOptions::dopri5(1e-5, 1e-6);
        let mut stats = SolverStats::default();
        let mut carried = None;
        let period = 2.0 * std::f64::consts::PI;
        let z1 = dopri5_interval(&f, &z0, 0.0, period, &opts, &mut carried, &mut stats)?;
        let v = z1.flatten_all()?.to_vec1::<f32>()?;
        assert!((v[0] - 1.0).abs() < 1e-3, "x(T) = {}", v[0]);
        assert!(v[1].abs() < 1e-3, "v(T) = {}", v[1]);
        assert!(carried.is_some());
        assert!(stats.accepted_steps > 1);
        assert!(stats.nfe >= 6 * stats.total_steps());
        Ok(())
    }
}

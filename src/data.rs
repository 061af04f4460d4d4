use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::SpiralConfig;

// ---------------------------------------------------------------------------
// Canonical spirals
// ---------------------------------------------------------------------------

/// `n` evenly spaced values in `[start, stop]`, both ends included.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { stop } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// The two noiseless trajectories every batch instance is cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSpirals {
    pub clockwise: Vec<[f64; 2]>,
    pub counter_clockwise: Vec<[f64; 2]>,
}

impl CanonicalSpirals {
    pub fn get(&self, clockwise: bool) -> &[[f64; 2]] {
        if clockwise {
            &self.clockwise
        } else {
            &self.counter_clockwise
        }
    }
}

/// Deterministic in `(a, b, start, stop, ts)`.
///
/// Clockwise: `θ = stop + 1 - t`, `r = a + 50 b / θ`, centred at x = -5.
/// Counter-clockwise: `θ = t`, `r = a + b θ`, centred at x = +5.
pub fn canonical_spirals(cfg: &SpiralConfig, ts: &[f64]) -> CanonicalSpirals {
    let clockwise = ts
        .iter()
        .map(|&t| {
            let theta = cfg.stop + 1.0 - t;
            let r = cfg.a + cfg.b * 50.0 / theta;
            [r * theta.cos() - 5.0, r * theta.sin()]
        })
        .collect();
    let counter_clockwise = ts
        .iter()
        .map(|&theta| {
            let r = cfg.a + cfg.b * theta;
            [r * theta.cos() + 5.0, r * theta.sin()]
        })
        .collect();
    CanonicalSpirals {
        clockwise,
        counter_clockwise,
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One batch of spirals plus the time grids shared by every instance.
pub struct SpiralBatch {
    /// (nspiral, ntotal, 2)
    pub orig_trajs: Tensor,
    /// (nspiral, nsample, 2), noisy
    pub samp_trajs: Tensor,
    /// Full grid, length ntotal.
    pub orig_ts: Vec<f64>,
    /// First nsample entries of `orig_ts`.
    pub samp_ts: Vec<f64>,
    /// Window start index of each instance.
    pub t0_idx: Vec<usize>,
    pub clockwise: Vec<bool>,
}

impl SpiralBatch {
    pub fn nspiral(&self) -> usize {
        self.t0_idx.len()
    }

    pub fn nsample(&self) -> usize {
        self.samp_ts.len()
    }

    pub fn ntotal(&self) -> usize {
        self.orig_ts.len()
    }

    /// Checks shapes and the window/time-grid invariants.
    pub fn validate(&self) -> Result<()> {
        let (n, ntotal, nsample) = (self.nspiral(), self.ntotal(), self.nsample());
        anyhow::ensure!(self.clockwise.len() == n, "batch has {} rotations for {n} spirals", self.clockwise.len());
        anyhow::ensure!(
            self.orig_trajs.dims() == [n, ntotal, 2],
            "orig_trajs shape {:?}, expected {:?}",
            self.orig_trajs.dims(),
            [n, ntotal, 2]
        );
        anyhow::ensure!(
            self.samp_trajs.dims() == [n, nsample, 2],
            "samp_trajs shape {:?}, expected {:?}",
            self.samp_trajs.dims(),
            [n, nsample, 2]
        );
        anyhow::ensure!(
            nsample.checked_mul(2).is_some_and(|reserved| ntotal > reserved)
                && self.orig_ts[..nsample] == self.samp_ts[..],
            "sampled time grid must be the head of the full grid"
        );
        for &t0 in &self.t0_idx {
            anyhow::ensure!(
                t0 >= nsample && t0 < ntotal - nsample,
                "window start {t0} outside [{nsample}, {})",
                ntotal - nsample
            );
        }
        Ok(())
    }
}

/// Build a batch of noisy spiral windows.
///
/// Each instance picks a window start uniformly in `[nsample, ntotal - nsample)`,
/// a rotation by fair coin, and adds N(0, noise_std²) to every coordinate.
pub fn generate_spiral2d<R: Rng>(cfg: &SpiralConfig, rng: &mut R, device: &Device) -> Result<SpiralBatch> {
    cfg.validate()?;
    let orig_ts = linspace(cfg.start, cfg.stop, cfg.ntotal);
    let samp_ts = orig_ts[..cfg.nsample].to_vec();
    let spirals = canonical_spirals(cfg, &orig_ts);
    let noise = Normal::new(0.0, cfg.noise_std)?;

    let mut orig = Vec::with_capacity(cfg.nspiral * cfg.ntotal * 2);
    let mut samp = Vec::with_capacity(cfg.nspiral * cfg.nsample * 2);
    let mut t0_idx = Vec::with_capacity(cfg.nspiral);
    let mut clockwise = Vec::with_capacity(cfg.nspiral);

    for _ in 0..cfg.nspiral {
        let t0 = rng.gen_range(0..cfg.offset_choices()) + cfg.nsample;
        let cw = rng.gen_bool(0.5);
        let traj = spirals.get(cw);

        orig.extend(traj.iter().flat_map(|p| p.iter().map(|&v| v as f32)));
        for point in &traj[t0..t0 + cfg.nsample] {
            for &v in point {
                samp.push((v + noise.sample(rng)) as f32);
            }
        }
        t0_idx.push(t0);
        clockwise.push(cw);
    }

    let batch = SpiralBatch {
        orig_trajs: Tensor::from_vec(orig, (cfg.nspiral, cfg.ntotal, 2), device)?,
        samp_trajs: Tensor::from_vec(samp, (cfg.nspiral, cfg.nsample, 2), device)?,
        orig_ts,
        samp_ts,
        t0_idx,
        clockwise,
    };
    batch.validate()?;
    Ok(batch)
}

pub fn times_to_tensor(ts: &[f64], device: &Device) -> Result<Tensor> {
    Tensor::from_slice(ts, ts.len(), device).map_err(Into::into)
}

pub fn tensor_to_times(t: &Tensor) -> Result<Vec<f64>> {
    t.to_dtype(DType::F64)?.to_vec1::<f64>().map_err(Into::into)
}

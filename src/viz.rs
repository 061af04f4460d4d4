use std::fs;
use std::ops::Range;
use std::path::Path;

use anyhow::Result;
use candle_core::{DType, Tensor};
use plotters::prelude::*;

use crate::data::CanonicalSpirals;

const SIZE: (u32, u32) = (800, 800);
const CYAN: RGBColor = RGBColor(0, 170, 170);

fn plot_err<E: std::fmt::Display>(e: E) -> anyhow::Error {
    anyhow::anyhow!("plot: {e}")
}

/// `(n, 2)` tensor to a list of points.
pub fn points_from_tensor(t: &Tensor) -> Result<Vec<[f64; 2]>> {
    let (_, d) = t.dims2()?;
    anyhow::ensure!(d == 2, "expected 2D points, got dimension {d}");
    let rows = t.to_dtype(DType::F64)?.to_vec2::<f64>()?;
    Ok(rows.into_iter().map(|r| [r[0], r[1]]).collect())
}

/// Bounding box of every point, padded by 5% on each side.
fn bounds<'a>(sets: impl IntoIterator<Item = &'a [[f64; 2]]>) -> Result<(Range<f64>, Range<f64>)> {
    let mut lo = [f64::INFINITY; 2];
    let mut hi = [f64::NEG_INFINITY; 2];
    for p in sets.into_iter().flatten() {
        for k in 0..2 {
            if p[k].is_finite() {
                lo[k] = lo[k].min(p[k]);
                hi[k] = hi[k].max(p[k]);
            }
        }
    }
    anyhow::ensure!(lo[0] <= hi[0] && lo[1] <= hi[1], "nothing finite to plot");
    let pad = |k: usize| ((hi[k] - lo[k]) * 0.05).max(1e-3);
    Ok((lo[0] - pad(0)..hi[0] + pad(0), lo[1] - pad(1)..hi[1] + pad(1)))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn xy(points: &[[f64; 2]]) -> impl Iterator<Item = (f64, f64)> + '_ {
    points.iter().map(|p| (p[0], p[1]))
}

// ---------------------------------------------------------------------------
// Plots
// ---------------------------------------------------------------------------

/// Both noiseless spirals: clockwise in green, counter-clockwise in blue.
pub fn plot_ground_truth(path: &Path, spirals: &CanonicalSpirals) -> Result<()> {
    ensure_parent(path)?;
    let (xr, yr) = bounds([spirals.clockwise.as_slice(), spirals.counter_clockwise.as_slice()])?;
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(xr, yr)
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(xy(&spirals.clockwise), &GREEN))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(xy(&spirals.counter_clockwise), &BLUE))
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

/// One instance: the learned trajectory forward (red) and backward (cyan) in
/// time, the true spiral (green) and the noisy observations (blue dots).
pub struct Reconstruction<'a> {
    pub forward: &'a [[f64; 2]],
    pub backward: &'a [[f64; 2]],
    pub truth: &'a [[f64; 2]],
    pub observed: &'a [[f64; 2]],
}

pub fn plot_reconstruction(path: &Path, r: &Reconstruction) -> Result<()> {
    ensure_parent(path)?;
    let (xr, yr) = bounds([r.forward, r.backward, r.truth, r.observed])?;
    let root = SVGBackend::new(path, SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .margin(10)
        .build_cartesian_2d(xr, yr)
        .map_err(plot_err)?;

    chart
        .draw_series(LineSeries::new(xy(r.truth), &GREEN))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(xy(r.forward), &RED))
        .map_err(plot_err)?;
    chart
        .draw_series(LineSeries::new(xy(r.backward), &CYAN))
        .map_err(plot_err)?;
    chart
        .draw_series(xy(r.observed).map(|p| Circle::new(p, 2, BLUE.filled())))
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpiralConfig;
    use crate::data::{canonical_spirals, linspace};
    use candle_core::Device;

    #[test]
    fn test_points_from_tensor() -> Result<()> {
        let t = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu)?;
        assert_eq!(points_from_tensor(&t)?, vec![[1.0, 2.0], [3.0, 4.0]]);
        let bad = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        assert!(points_from_tensor(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_bounds_skip_non_finite() -> Result<()> {
        let pts = [[0.0, 0.0], [f64::NAN, 5.0], [10.0, 10.0]];
        let (xr, yr) = bounds([pts.as_slice()])?;
        assert!(xr.start < 0.0 && xr.end > 10.0);
        assert!(yr.start < 0.0 && yr.end > 10.0);
        assert!(bounds([[[f64::NAN, f64::NAN]].as_slice()]).is_err());
        Ok(())
    }

    #[test]
    fn test_writes_svg_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let cfg = SpiralConfig::test_spiral();
        let ts = linspace(cfg.start, cfg.stop, cfg.ntotal);
        let spirals = canonical_spirals(&cfg, &ts);

        let gt = dir.path().join("vis").join("ground_truth.svg");
        plot_ground_truth(&gt, &spirals)?;
        assert!(fs::read_to_string(&gt)?.contains("<svg"));

        let out = dir.path().join("vis_3.svg");
        let r = Reconstruction {
            forward: &spirals.clockwise,
            backward: &spirals.counter_clockwise,
            truth: &spirals.clockwise,
            observed: &spirals.clockwise[..5],
        };
        plot_reconstruction(&out, &r)?;
        assert!(out.exists());
        Ok(())
    }
}

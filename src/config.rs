use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::ode::OdeOptions;

// ---------------------------------------------------------------------------
// Spiral generator config
// ---------------------------------------------------------------------------

/// Shape and sampling parameters for the synthetic spiral batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiralConfig {
    /// Number of spirals, i.e. the batch dimension.
    pub nspiral: usize,
    /// Points per full trajectory.
    pub ntotal: usize,
    /// Points per noisy observation window.
    pub nsample: usize,
    pub start: f64,
    pub stop: f64,
    /// Standard deviation of the additive observation noise.
    pub noise_std: f64,
    /// Archimedean spiral `r = a + b * theta`.
    pub a: f64,
    pub b: f64,
}

impl SpiralConfig {
    /// Settings used for a full training run.
    pub fn default_spiral() -> Self {
        Self {
            nspiral: 999,
            ntotal: 1000,
            nsample: 400,
            start: 0.0,
            stop: 6.0 * std::f64::consts::PI,
            noise_std: 0.3,
            a: 0.0,
            b: 0.3,
        }
    }

    /// Small batch for tests and smoke runs.
    pub fn test_spiral() -> Self {
        Self {
            nspiral: 4,
            ntotal: 20,
            nsample: 8,
            start: 0.0,
            stop: 1.0,
            noise_std: 0.1,
            a: 0.0,
            b: 1.0,
        }
    }

    /// Number of admissible window start indices.
    pub fn offset_choices(&self) -> usize {
        self.ntotal.saturating_sub(self.nsample.saturating_mul(2))
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.nspiral > 0, "nspiral must be positive");
        anyhow::ensure!(self.nsample > 0, "nsample must be positive");
        let reserved = self
            .nsample
            .checked_mul(2)
            .with_context(|| format!("nsample ({}) is too large", self.nsample))?;
        anyhow::ensure!(
            self.ntotal > reserved,
            "ntotal ({}) must exceed 2 * nsample ({reserved}): no valid window start offsets",
            self.ntotal
        );
        anyhow::ensure!(
            self.start.is_finite() && self.stop.is_finite() && self.stop > self.start,
            "time interval [{}, {}] must be finite and increasing",
            self.start,
            self.stop
        );
        anyhow::ensure!(
            self.noise_std.is_finite() && self.noise_std >= 0.0,
            "noise_std must be a non-negative finite number, got {}",
            self.noise_std
        );
        anyhow::ensure!(
            self.a.is_finite() && self.b.is_finite(),
            "spiral parameters a={} b={} must be finite",
            self.a,
            self.b
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Model config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub latent_dim: usize,
    pub obs_dim: usize,
    /// Hidden width of the dynamics function and the decoder.
    pub nhidden: usize,
    /// Hidden width of the recognition RNN.
    pub rnn_nhidden: usize,
}

impl ModelConfig {
    pub fn default_model() -> Self {
        Self {
            latent_dim: 4,
            obs_dim: 2,
            nhidden: 20,
            rnn_nhidden: 25,
        }
    }

    pub fn tiny() -> Self {
        Self {
            latent_dim: 4,
            obs_dim: 2,
            nhidden: 8,
            rnn_nhidden: 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.latent_dim > 0 && self.obs_dim > 0 && self.nhidden > 0 && self.rnn_nhidden > 0,
            "model dimensions must all be positive: {:?}",
            self
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Training config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub niters: usize,
    pub lr: f64,
    /// Use the adjoint method for gradients through the solver.
    pub adjoint: bool,
    pub visualize: bool,
    pub viz_every: usize,
    pub viz_dir: PathBuf,
    /// Dense grid size for the visualization extrapolation.
    pub viz_points: usize,
    pub train_dir: Option<PathBuf>,
    /// Fixed observation noise std of the likelihood (not learned).
    pub obs_noise_std: f64,
    /// Momentum of the running loss average.
    pub loss_momentum: f64,
    pub seed: u64,
}

impl TrainConfig {
    pub fn default_train() -> Self {
        Self {
            niters: 2000,
            lr: 0.01,
            adjoint: true,
            visualize: true,
            viz_every: 100,
            viz_dir: PathBuf::from("vis"),
            viz_points: 2000,
            train_dir: None,
            obs_noise_std: 0.3,
            loss_momentum: 0.99,
            seed: 0,
        }
    }

    pub fn test_train() -> Self {
        Self {
            niters: 5,
            lr: 0.01,
            adjoint: false,
            visualize: false,
            viz_every: 100,
            viz_dir: PathBuf::from("vis"),
            viz_points: 50,
            train_dir: None,
            obs_noise_std: 0.1,
            loss_momentum: 0.99,
            seed: 7,
        }
    }

    pub fn checkpoint_path(&self) -> Option<PathBuf> {
        self.train_dir
            .as_ref()
            .map(|dir| dir.join(crate::checkpoint::CHECKPOINT_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.lr.is_finite() && self.lr > 0.0, "lr must be positive, got {}", self.lr);
        anyhow::ensure!(self.viz_every > 0, "viz_every must be positive");
        anyhow::ensure!(self.viz_points >= 2, "viz_points must be at least 2");
        anyhow::ensure!(
            self.obs_noise_std.is_finite() && self.obs_noise_std > 0.0,
            "obs_noise_std must be positive, got {}",
            self.obs_noise_std
        );
        anyhow::ensure!(
            (0.0..1.0).contains(&self.loss_momentum),
            "loss_momentum must be in [0, 1), got {}",
            self.loss_momentum
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run config
// ---------------------------------------------------------------------------

/// Everything a run needs, built once in `main` and passed down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub spiral: SpiralConfig,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub solver: OdeOptions,
}

impl RunConfig {
    pub fn default_run() -> Self {
        Self {
            spiral: SpiralConfig::default_spiral(),
            model: ModelConfig::default_model(),
            train: TrainConfig::default_train(),
            solver: OdeOptions::default(),
        }
    }

    pub fn test_run() -> Self {
        Self {
            spiral: SpiralConfig::test_spiral(),
            model: ModelConfig::tiny(),
            train: TrainConfig::test_train(),
            solver: OdeOptions::rk4(0.05),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.spiral.validate().context("invalid spiral config")?;
        self.model.validate().context("invalid model config")?;
        self.train.validate().context("invalid training config")?;
        self.solver.validate().context("invalid solver config")?;
        anyhow::ensure!(
            self.model.obs_dim == 2,
            "spiral observations are 2D, model obs_dim is {}",
            self.model.obs_dim
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tiers_validate() -> Result<()> {
        RunConfig::default_run().validate()?;
        RunConfig::test_run().validate()?;
        Ok(())
    }

    #[test]
    fn test_degenerate_offsets_rejected() {
        let mut cfg = SpiralConfig::test_spiral();
        cfg.ntotal = 16;
        cfg.nsample = 8;
        assert_eq!(cfg.offset_choices(), 0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("no valid window start"), "{err}");
    }

    #[test]
    fn test_huge_nsample_rejected_without_overflow() {
        let mut cfg = SpiralConfig::test_spiral();
        cfg.nsample = usize::MAX;
        cfg.ntotal = usize::MAX;
        assert_eq!(cfg.offset_choices(), 0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");

        cfg.nsample = usize::MAX / 2 + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_nsample_rejected() {
        let mut cfg = SpiralConfig::test_spiral();
        cfg.nsample = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.json");
        let cfg = RunConfig::test_run();
        std::fs::write(&path, serde_json::to_string_pretty(&cfg)?)?;
        let loaded = RunConfig::from_json_file(&path)?;
        assert_eq!(loaded, cfg);
        Ok(())
    }

    #[test]
    fn test_checkpoint_path_follows_train_dir() {
        let mut train = TrainConfig::test_train();
        assert!(train.checkpoint_path().is_none());
        train.train_dir = Some(PathBuf::from("runs/a"));
        assert_eq!(
            train.checkpoint_path(),
            Some(PathBuf::from("runs/a").join(crate::checkpoint::CHECKPOINT_FILE))
        );
    }
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::{Device, IndexOp, Tensor, Var};
use candle_nn::Optimizer;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};
use tracing::{debug, info, warn};

use crate::checkpoint::{load_checkpoint, save_checkpoint};
use crate::config::RunConfig;
use crate::data::{canonical_spirals, generate_spiral2d, linspace, SpiralBatch};
use crate::model::{LatentOde, Posterior};
use crate::ode::{odeint, odeint_adjoint, SolverStats};
use crate::optim::{Adam, ParamsAdam};
use crate::viz::{plot_ground_truth, plot_reconstruction, points_from_tensor, Reconstruction};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

// ---------------------------------------------------------------------------
// Gaussian log-density + KL
// ---------------------------------------------------------------------------

/// Element-wise log N(x; mean, exp(logvar)).
pub fn log_normal_pdf(x: &Tensor, mean: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let quad = ((x - mean)?.sqr()? * logvar.neg()?.exp()?)?;
    let inner = ((logvar + quad)? + LN_2PI)?;
    (inner * -0.5).map_err(Into::into)
}

/// Element-wise KL(N(mu1, exp(lv1)) || N(mu2, exp(lv2))).
pub fn normal_kl(mu1: &Tensor, lv1: &Tensor, mu2: &Tensor, lv2: &Tensor) -> Result<Tensor> {
    let v1 = lv1.exp()?;
    let v2 = lv2.exp()?;
    let log_ratio = ((lv2 - lv1)? * 0.5)?;
    let spread = ((v1 + (mu1 - mu2)?.sqr()?)? / (v2 * 2.0)?)?;
    ((log_ratio + spread)? - 0.5).map_err(Into::into)
}

/// Batch mean of `KL(q(z0) || N(0, I)) - log p(x | z)`. `pred_x` and `obs`
/// are `(batch, time, obs_dim)`; the likelihood has fixed std `noise_std`.
pub fn elbo_loss(pred_x: &Tensor, obs: &Tensor, q: &Posterior, noise_std: f64) -> Result<Tensor> {
    let noise_logvar = Tensor::full((2.0 * noise_std.ln()) as f32, obs.shape(), obs.device())?;
    let logpx = log_normal_pdf(obs, pred_x, &noise_logvar)?.sum(2)?.sum(1)?;
    let prior = q.mean.zeros_like()?;
    let kl = normal_kl(&q.mean, &q.logvar, &prior, &prior)?.sum(1)?;
    (kl - logpx)?.mean_all().map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Reparameterization
// ---------------------------------------------------------------------------

/// `mean + exp(0.5 * logvar) * eps`.
pub fn reparameterize(mean: &Tensor, logvar: &Tensor, eps: &Tensor) -> Result<Tensor> {
    let std = (logvar * 0.5)?.exp()?;
    (mean + (std * eps)?).map_err(Into::into)
}

/// Standard normal noise of `mean`'s shape, drawn from `rng`.
pub fn standard_normal_like(mean: &Tensor, rng: &mut StdRng) -> Result<Tensor> {
    let n = mean.elem_count();
    let data: Vec<f32> = (0..n)
        .map(|_| Distribution::<f32>::sample(&StandardNormal, rng))
        .collect();
    Tensor::from_vec(data, mean.shape(), mean.device()).map_err(Into::into)
}

/// Per-iteration noise stream, so a resumed run draws the same noise an
/// uninterrupted run would have.
fn iteration_rng(seed: u64, itr: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (itr as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

fn diverged(itr: usize) -> String {
    format!("parameters diverged at iteration {itr}")
}

// ---------------------------------------------------------------------------
// Running average
// ---------------------------------------------------------------------------

/// Exponential moving average; the first update sets the average directly.
#[derive(Debug, Clone)]
pub struct RunningAverageMeter {
    momentum: f64,
    val: Option<f64>,
    avg: f64,
}

impl RunningAverageMeter {
    pub fn new(momentum: f64) -> Self {
        Self {
            momentum,
            val: None,
            avg: 0.0,
        }
    }

    pub fn update(&mut self, val: f64) {
        self.avg = match self.val {
            None => val,
            Some(_) => self.avg * self.momentum + val * (1.0 - self.momentum),
        };
        self.val = Some(val);
    }

    pub fn reset(&mut self) {
        self.val = None;
        self.avg = 0.0;
    }

    pub fn val(&self) -> Option<f64> {
        self.val
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct StepReport {
    pub loss: f64,
    pub forward: SolverStats,
    /// Adjoint backward solve; zero in direct mode.
    pub backward: SolverStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { iteration: usize },
    Interrupted { iteration: usize },
}

pub struct Trainer {
    pub config: RunConfig,
    pub model: LatentOde,
    pub optimizer: Adam,
    pub batch: SpiralBatch,
    pub meter: RunningAverageMeter,
    /// Last completed iteration; 0 before training.
    pub iteration: usize,
    device: Device,
    timer_start: Instant,
}

impl Trainer {
    /// Build the model, optimizer and data batch. When the configured
    /// checkpoint exists, parameters, optimizer state, batch and iteration
    /// counter are restored from it instead.
    pub fn new(config: RunConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let model = LatentOde::new(config.model.clone(), &device)?;
        let params = ParamsAdam {
            lr: config.train.lr,
            ..ParamsAdam::default()
        };
        let mut optimizer = Adam::with_names(model.named_params(), params)?;

        let checkpoint = config.train.checkpoint_path().filter(|p| p.exists());
        let (batch, iteration) = match checkpoint {
            Some(path) => {
                let restored = load_checkpoint(&path, &model, &mut optimizer, &device)?;
                (restored.batch, restored.iteration)
            }
            None => {
                let mut rng = StdRng::seed_from_u64(config.train.seed);
                (generate_spiral2d(&config.spiral, &mut rng, &device)?, 0)
            }
        };
        anyhow::ensure!(
            batch.nsample() == config.spiral.nsample && batch.nspiral() == config.spiral.nspiral,
            "checkpointed batch is {}x{}, config asks for {}x{}",
            batch.nspiral(),
            batch.nsample(),
            config.spiral.nspiral,
            config.spiral.nsample
        );

        info!(
            params = model.param_count(),
            nspiral = batch.nspiral(),
            nsample = batch.nsample(),
            solver = config.solver.method.name(),
            adjoint = config.train.adjoint,
            resume_from = iteration,
            "trainer ready"
        );
        let meter = RunningAverageMeter::new(config.train.loss_momentum);
        Ok(Self {
            config,
            model,
            optimizer,
            batch,
            meter,
            iteration,
            device,
            timer_start: Instant::now(),
        })
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.timer_start.elapsed().as_secs_f64()
    }

    /// Posterior over z0 and one reparameterized sample from it.
    fn sample_z0(&self, itr: usize) -> Result<(Posterior, Tensor)> {
        let q = self.model.rec.encode(&self.batch.samp_trajs)?;
        let mut rng = iteration_rng(self.config.train.seed, itr);
        let eps = standard_normal_like(&q.mean, &mut rng)?;
        let z0 = reparameterize(&q.mean, &q.logvar, &eps)?;
        Ok((q, z0))
    }

    fn decode_trajectory(&self, ys: &Tensor) -> Result<Tensor> {
        // (time, batch, latent) -> (batch, time, latent)
        let pred_z = ys.permute((1, 0, 2))?.contiguous()?;
        self.model.dec.forward(&pred_z)
    }

    fn checked_loss(&self, loss: &Tensor, itr: usize) -> Result<f64> {
        let value = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        anyhow::ensure!(
            value.is_finite(),
            "loss is not finite at iteration {itr} ({value}); the solver or optimizer diverged"
        );
        Ok(value)
    }

    /// One optimization step on the whole batch. Fails when the loss or any
    /// updated parameter is not finite.
    pub fn train_step(&mut self, itr: usize) -> Result<StepReport> {
        if self.config.train.adjoint {
            self.adjoint_step(itr)
        } else {
            self.direct_step(itr)
        }
    }

    /// Back-propagate through every solver step.
    fn direct_step(&mut self, itr: usize) -> Result<StepReport> {
        let (q, z0) = self.sample_z0(itr)?;
        let sol = odeint(&self.model.func, &z0, &self.batch.samp_ts, &self.config.solver)?;
        let pred_x = self.decode_trajectory(&sol.ys)?;
        let loss = elbo_loss(&pred_x, &self.batch.samp_trajs, &q, self.config.train.obs_noise_std)?;
        let value = self.checked_loss(&loss, itr)?;
        self.optimizer
            .backward_step(&loss)
            .with_context(|| diverged(itr))?;
        Ok(StepReport {
            loss: value,
            forward: sol.stats,
            backward: SolverStats::default(),
        })
    }

    /// Gradients of the dynamics parameters and of z0 come from the adjoint
    /// solve; the recognition network receives `∂L/∂z0` through a second
    /// backward pass over the reparameterization.
    fn adjoint_step(&mut self, itr: usize) -> Result<StepReport> {
        let (q, z0) = self.sample_z0(itr)?;
        let solver = &self.config.solver;
        let sol = odeint_adjoint(&self.model.func, &z0, &self.batch.samp_ts, solver)?;

        let ys = Var::from_tensor(&sol.ys)?;
        let pred_x = self.decode_trajectory(ys.as_tensor())?;
        let loss = elbo_loss(&pred_x, &self.batch.samp_trajs, &q, self.config.train.obs_noise_std)?;
        let value = self.checked_loss(&loss, itr)?;
        let grads = loss.backward()?;
        let grad_ys = grads
            .get(ys.as_tensor())
            .cloned()
            .context("loss does not depend on the latent trajectory")?;

        let func_named = self.model.func_params.named_vars();
        let func_vars: Vec<Var> = func_named.iter().map(|(_, v)| v.clone()).collect();
        let adj = sol.backward(&self.model.func, &func_vars, &grad_ys, solver)?;
        let path_grads = (&z0 * &adj.grad_z0)?.sum_all()?.backward()?;

        let mut named: HashMap<String, Tensor> = HashMap::new();
        for ((name, _), g) in func_named.into_iter().zip(adj.grad_params) {
            named.insert(name, g);
        }
        for set in [&self.model.rec_params, &self.model.dec_params] {
            for (name, var) in set.named_vars() {
                let g = match (grads.get(var.as_tensor()), path_grads.get(var.as_tensor())) {
                    (Some(a), Some(b)) => (a + b)?,
                    (Some(g), None) | (None, Some(g)) => g.clone(),
                    (None, None) => continue,
                };
                named.insert(name, g);
            }
        }
        self.optimizer.step_named(&named).with_context(|| diverged(itr))?;

        Ok(StepReport {
            loss: value,
            forward: sol.stats,
            backward: adj.stats,
        })
    }

    // -----------------------------------------------------------------------
    // Visualization
    // -----------------------------------------------------------------------

    pub fn plot_ground_truth(&self) -> Result<()> {
        let ts = linspace(self.config.spiral.start, self.config.spiral.stop, self.config.spiral.ntotal);
        let spirals = canonical_spirals(&self.config.spiral, &ts);
        let path = self.config.train.viz_dir.join("ground_truth.svg");
        plot_ground_truth(&path, &spirals)?;
        info!(path = %path.display(), "saved ground truth figure");
        Ok(())
    }

    /// Latent path of `z0` (batch of one) at `n` points over `[0, 2π]` and at
    /// `n` points over `[-2π, 0]`, both in increasing time. No autograd graph.
    fn extrapolate(&self, z0: &Tensor, n: usize) -> Result<(Tensor, Tensor)> {
        let two_pi = 2.0 * std::f64::consts::PI;
        let ts_pos = linspace(0.0, two_pi, n);
        let mut ts_neg = linspace(-two_pi, 0.0, n);
        ts_neg.reverse();

        let solver = &self.config.solver;
        let zs_pos = odeint_adjoint(&self.model.func, z0, &ts_pos, solver)?.ys.squeeze(1)?;
        let zs_neg = odeint_adjoint(&self.model.func, z0, &ts_neg, solver)?.ys.squeeze(1)?;
        let rev: Vec<u32> = (0..n as u32).rev().collect();
        let rev = Tensor::from_vec(rev, n, &self.device)?;
        Ok((zs_pos, zs_neg.index_select(&rev, 0)?))
    }

    /// Extrapolate instance 0 forward over `[0, 2π]` and backward over
    /// `[-2π, 0]` from a posterior sample and write `vis_{itr}.svg`.
    pub fn visualize(&self, itr: usize) -> Result<()> {
        let n = self.config.train.viz_points;
        let q = self.model.rec.encode(&self.batch.samp_trajs.i(0..1)?)?;
        let mut rng = iteration_rng(self.config.train.seed.wrapping_add(1), itr);
        let eps = standard_normal_like(&q.mean, &mut rng)?;
        let z0 = reparameterize(&q.mean, &q.logvar, &eps)?.detach();
        let (zs_pos, zs_neg) = self.extrapolate(&z0, n)?;

        let xs_pos = points_from_tensor(&self.model.dec.forward(&zs_pos)?.detach())?;
        let xs_neg = points_from_tensor(&self.model.dec.forward(&zs_neg)?.detach())?;
        let truth = points_from_tensor(&self.batch.orig_trajs.i(0)?)?;
        let observed = points_from_tensor(&self.batch.samp_trajs.i(0)?)?;

        let path = self.config.train.viz_dir.join(format!("vis_{itr}.svg"));
        plot_reconstruction(
            &path,
            &Reconstruction {
                forward: &xs_pos,
                backward: &xs_neg,
                truth: &truth,
                observed: &observed,
            },
        )?;
        info!(path = %path.display(), "saved visualization");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        save_checkpoint(path, &self.model, &self.optimizer, &self.batch, self.iteration)
    }

    fn save_if_configured(&self) -> Result<()> {
        match self.config.train.checkpoint_path() {
            Some(path) => self.save(&path),
            None => Ok(()),
        }
    }

    /// Train from the iteration after `self.iteration` up to `niters`.
    /// `stop` is polled between iterations; once set, the checkpoint (if
    /// configured) is written and the loop returns `Interrupted`.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<RunOutcome> {
        let visualize = self.config.train.visualize;
        if visualize {
            self.plot_ground_truth()?;
        }

        for itr in self.iteration + 1..=self.config.train.niters {
            if stop.load(Ordering::SeqCst) {
                return self.interrupt();
            }
            let report = self.train_step(itr)?;
            self.iteration = itr;
            self.meter.update(report.loss);
            info!(
                loss = format_args!("{:.4}", report.loss),
                "Iter: {itr}, running avg elbo: {:.4}",
                -self.meter.avg()
            );
            debug!(
                iter = itr,
                nfe_forward = report.forward.nfe,
                nfe_backward = report.backward.nfe,
                rejected = report.forward.rejected_steps + report.backward.rejected_steps,
                elapsed_secs = format_args!("{:.1}", self.elapsed_secs()),
                "solver"
            );

            if visualize && itr % self.config.train.viz_every == 0 {
                self.visualize(itr)?;
            }
        }

        if stop.load(Ordering::SeqCst) {
            return self.interrupt();
        }
        self.save_if_configured()?;
        info!(
            iteration = self.iteration,
            elapsed_secs = format_args!("{:.1}", self.elapsed_secs()),
            "training finished"
        );
        Ok(RunOutcome::Completed {
            iteration: self.iteration,
        })
    }

    fn interrupt(&self) -> Result<RunOutcome> {
        warn!(iteration = self.iteration, "interrupted");
        if let Err(e) = self.save_if_configured() {
            warn!("failed to save checkpoint on interrupt: {e:#}");
        }
        Ok(RunOutcome::Interrupted {
            iteration: self.iteration,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

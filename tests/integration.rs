// End-to-end training tests on the small config tier.
//
// nspiral=4, ntotal=20, nsample=8 on [0, 1] with tiny networks and RK4, so
// every test runs a handful of real optimization steps in well under a second.

use std::sync::atomic::AtomicBool;

use anyhow::Result;
use candle_core::{Device, Tensor};
use spiral_ode::checkpoint::CHECKPOINT_FILE;
use spiral_ode::config::RunConfig;
use spiral_ode::model::ParamSet;
use spiral_ode::training::{RunOutcome, Trainer};

fn flat(set: &ParamSet) -> Result<Vec<f32>> {
    let mut out = Vec::new();
    for v in set.vars() {
        out.extend(v.as_tensor().flatten_all()?.to_vec1::<f32>()?);
    }
    Ok(out)
}

fn snapshot(trainer: &Trainer) -> Result<Vec<Vec<f32>>> {
    trainer.model.param_sets().iter().map(|s| flat(s)).collect()
}

fn config(adjoint: bool) -> RunConfig {
    let mut cfg = RunConfig::test_run();
    cfg.train.adjoint = adjoint;
    cfg
}

fn single_step_updates_all_networks(adjoint: bool) -> Result<()> {
    let mut trainer = Trainer::new(config(adjoint), Device::Cpu)?;
    let before = snapshot(&trainer)?;
    let report = trainer.train_step(1)?;
    assert!(report.loss.is_finite(), "loss {}", report.loss);
    assert!(report.forward.nfe > 0);
    if adjoint {
        assert!(report.backward.nfe > 0, "adjoint solve did no work");
    }

    let after = snapshot(&trainer)?;
    for (name, (b, a)) in ["func", "rec", "dec"].iter().zip(before.iter().zip(&after)) {
        assert_ne!(b, a, "{name} parameters did not change");
    }
    assert_eq!(trainer.optimizer.step_count(), 1);
    Ok(())
}

// ---------------------------------------------------------------------------
// Training step
// ---------------------------------------------------------------------------

#[test]
fn test_direct_step_updates_all_networks() -> Result<()> {
    single_step_updates_all_networks(false)
}

#[test]
fn test_adjoint_step_updates_all_networks() -> Result<()> {
    single_step_updates_all_networks(true)
}

#[test]
fn test_adjoint_and_direct_see_same_loss() -> Result<()> {
    // Share parameters and batch through a checkpoint, then compare the
    // first-iteration loss of both gradient modes.
    let dir = tempfile::tempdir()?;
    let mut cfg = config(false);
    cfg.train.train_dir = Some(dir.path().to_path_buf());
    let mut direct = Trainer::new(cfg.clone(), Device::Cpu)?;
    direct.save(&dir.path().join(CHECKPOINT_FILE))?;

    cfg.train.adjoint = true;
    let mut adjoint = Trainer::new(cfg, Device::Cpu)?;
    assert_eq!(snapshot(&direct)?, snapshot(&adjoint)?);

    let a = direct.train_step(1)?.loss;
    let b = adjoint.train_step(1)?.loss;
    assert!((a - b).abs() < 1e-5 * a.abs().max(1.0), "direct {a} vs adjoint {b}");
    Ok(())
}

#[test]
fn test_loss_decreases_over_short_run() -> Result<()> {
    let mut cfg = config(false);
    cfg.train.niters = 30;
    let mut trainer = Trainer::new(cfg, Device::Cpu)?;
    let first = trainer.train_step(1)?.loss;
    let mut last = first;
    for itr in 2..=30 {
        last = trainer.train_step(itr)?.loss;
    }
    assert!(last < first, "loss went from {first} to {last}");
    Ok(())
}

fn poison(trainer: &Trainer, name: &str) -> Result<()> {
    let (_, var) = trainer
        .model
        .named_params()
        .into_iter()
        .find(|(n, _)| n == name)
        .ok_or_else(|| anyhow::anyhow!("no parameter named {name}"))?;
    var.set(&Tensor::full(f32::NAN, var.shape(), &Device::Cpu)?)?;
    Ok(())
}

fn step_error(trainer: &mut Trainer, itr: usize) -> String {
    match trainer.train_step(itr) {
        Ok(r) => panic!("expected an error, got loss {}", r.loss),
        Err(e) => e.to_string(),
    }
}

#[test]
fn test_non_finite_loss_is_reported() -> Result<()> {
    // The output layer feeds the likelihood directly.
    let mut trainer = Trainer::new(config(false), Device::Cpu)?;
    poison(&trainer, "dec.fc2.weight")?;
    let err = step_error(&mut trainer, 3);
    assert!(err.contains("loss is not finite at iteration 3"), "{err}");
    Ok(())
}

#[test]
fn test_non_finite_parameters_behind_relu_are_reported() -> Result<()> {
    // relu(NaN) is 0, so the loss stays finite and only the update check
    // catches the bad parameter.
    for adjoint in [false, true] {
        let mut trainer = Trainer::new(config(adjoint), Device::Cpu)?;
        poison(&trainer, "dec.fc1.bias")?;
        let err = step_error(&mut trainer, 3);
        assert!(err.contains("diverged at iteration 3"), "adjoint={adjoint}: {err}");
        assert_eq!(trainer.optimizer.step_count(), 0);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run loop: checkpoint, resume, interrupt, figures
// ---------------------------------------------------------------------------

#[test]
fn test_resume_continues_from_saved_iteration() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = config(true);
    cfg.train.niters = 2;
    cfg.train.train_dir = Some(dir.path().join("run"));

    let stop = AtomicBool::new(false);
    let mut first = Trainer::new(cfg.clone(), Device::Cpu)?;
    assert_eq!(first.run(&stop)?, RunOutcome::Completed { iteration: 2 });
    assert!(dir.path().join("run").join(CHECKPOINT_FILE).exists());
    let params = snapshot(&first)?;
    let t0_idx = first.batch.t0_idx.clone();

    cfg.train.niters = 4;
    let mut second = Trainer::new(cfg, Device::Cpu)?;
    assert_eq!(second.iteration, 2);
    assert_eq!(second.optimizer.step_count(), 2);
    assert_eq!(snapshot(&second)?, params);
    assert_eq!(second.batch.t0_idx, t0_idx);
    assert_eq!(second.run(&stop)?, RunOutcome::Completed { iteration: 4 });
    Ok(())
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let stop = AtomicBool::new(false);

    let mut cfg = config(false);
    cfg.train.niters = 1;
    cfg.train.train_dir = Some(dir.path().to_path_buf());
    let mut a = Trainer::new(cfg.clone(), Device::Cpu)?;
    a.run(&stop)?;

    // Same starting point, restored from the checkpoint.
    let mut b = Trainer::new(cfg, Device::Cpu)?;
    a.train_step(2)?;
    b.train_step(2)?;
    assert_eq!(snapshot(&a)?, snapshot(&b)?);
    Ok(())
}

#[test]
fn test_interrupt_saves_checkpoint() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = config(false);
    cfg.train.train_dir = Some(dir.path().to_path_buf());
    let mut trainer = Trainer::new(cfg.clone(), Device::Cpu)?;
    trainer.train_step(1)?;
    trainer.iteration = 1;

    let stop = AtomicBool::new(true);
    assert_eq!(trainer.run(&stop)?, RunOutcome::Interrupted { iteration: 1 });
    assert!(dir.path().join(CHECKPOINT_FILE).exists());

    let restored = Trainer::new(cfg, Device::Cpu)?;
    assert_eq!(restored.iteration, 1);
    assert_eq!(snapshot(&restored)?, snapshot(&trainer)?);
    Ok(())
}

#[test]
fn test_visualization_writes_figures() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = config(false);
    cfg.train.niters = 2;
    cfg.train.visualize = true;
    cfg.train.viz_every = 2;
    cfg.train.viz_points = 40;
    cfg.train.viz_dir = dir.path().join("vis");

    let mut trainer = Trainer::new(cfg, Device::Cpu)?;
    trainer.run(&AtomicBool::new(false))?;
    assert!(dir.path().join("vis").join("ground_truth.svg").exists());
    assert!(dir.path().join("vis").join("vis_2.svg").exists());
    assert!(!dir.path().join("vis").join("vis_1.svg").exists());
    Ok(())
}

#[test]
fn test_invalid_config_fails_fast() {
    let mut cfg = config(false);
    cfg.spiral.ntotal = 2 * cfg.spiral.nsample;
    assert!(Trainer::new(cfg, Device::Cpu).is_err());
}

// spiral-ode: latent ODE VAE on synthetic 2D spirals
//
//   spiral-ode [--adjoint true|false] [--visualize true|false] [--niters N]
//              [--lr LR] [--gpu IDX] [--train-dir DIR] [--config test|default]
//              [--config-file run.json] [--solver euler|rk4|dopri5] ...
//
// Config tiers: default (999 spirals, full-size networks), test (4 spirals,
// tiny networks, fixed-step RK4). A JSON config file replaces the tier;
// explicit flags override either.
// GPU: used when compiled with --features cuda and the device initializes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use candle_core::Device;
use clap::{ArgAction, Parser};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use spiral_ode::config::RunConfig;
use spiral_ode::ode::SolverKind;
use spiral_ode::training::{RunOutcome, Trainer};

const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[command(name = "spiral-ode")]
#[command(about = "Train a latent ODE model on noisy 2D spirals", long_about = None)]
struct Cli {
    /// Gradients through the solver via the adjoint method [default: true]
    #[arg(long, action = ArgAction::Set)]
    adjoint: Option<bool>,

    /// Write figures every --viz-every iterations [default: true]
    #[arg(long, action = ArgAction::Set)]
    visualize: Option<bool>,

    /// Training iterations [default: 2000]
    #[arg(long)]
    niters: Option<usize>,

    /// Adam learning rate [default: 0.01]
    #[arg(long)]
    lr: Option<f64>,

    /// CUDA device index
    #[arg(long, default_value_t = 0)]
    gpu: usize,

    /// Checkpoint directory; restored on startup when it holds a checkpoint
    #[arg(long)]
    train_dir: Option<PathBuf>,

    /// Config tier
    #[arg(long, default_value = "default", value_parser = ["test", "default"])]
    config: String,

    /// JSON run config, replaces the tier
    #[arg(long)]
    config_file: Option<PathBuf>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_parser = ["euler", "rk4", "dopri5"])]
    solver: Option<String>,

    #[arg(long)]
    viz_dir: Option<PathBuf>,

    #[arg(long)]
    viz_every: Option<usize>,

    /// trace, debug, info, warn or error
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Config Tier Selection
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq)]
enum ConfigTier {
    Test,
    Default,
}

impl ConfigTier {
    fn from_str(s: &str) -> Option<Self> {
        match s {
            "test" => Some(Self::Test),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    fn run_config(&self) -> RunConfig {
        match self {
            Self::Test => RunConfig::test_run(),
            Self::Default => RunConfig::default_run(),
        }
    }
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = match &cli.config_file {
        Some(path) => RunConfig::from_json_file(path)?,
        None => ConfigTier::from_str(&cli.config)
            .ok_or_else(|| anyhow::anyhow!("unknown config tier {:?}", cli.config))?
            .run_config(),
    };

    let train = &mut config.train;
    if let Some(v) = cli.adjoint {
        train.adjoint = v;
    }
    if let Some(v) = cli.visualize {
        train.visualize = v;
    }
    if let Some(v) = cli.niters {
        train.niters = v;
    }
    if let Some(v) = cli.lr {
        train.lr = v;
    }
    if let Some(v) = cli.seed {
        train.seed = v;
    }
    if let Some(v) = &cli.viz_dir {
        train.viz_dir = v.clone();
    }
    if let Some(v) = cli.viz_every {
        train.viz_every = v;
    }
    if cli.train_dir.is_some() {
        train.train_dir = cli.train_dir.clone();
    }
    if let Some(name) = &cli.solver {
        config.solver.method = match name.as_str() {
            "euler" => SolverKind::Euler,
            "rk4" => SolverKind::Rk4,
            "dopri5" => SolverKind::Dopri5,
            other => anyhow::bail!("unknown solver {other:?}"),
        };
    }

    config.validate()?;
    Ok(config)
}

/// CUDA device `index` when built with the `cuda` feature and available, else CPU.
fn select_device(index: usize) -> Device {
    #[cfg(feature = "cuda")]
    {
        if candle_core::utils::cuda_is_available() {
            match Device::new_cuda(index) {
                Ok(dev) => {
                    info!(device = index, "using CUDA");
                    return dev;
                }
                Err(e) => warn!("CUDA init failed, falling back to CPU: {e}"),
            }
        } else {
            info!("CUDA not available, using CPU");
        }
    }

    #[cfg(not(feature = "cuda"))]
    {
        if index != 0 {
            warn!(requested = index, "built without the cuda feature, using CPU");
        }
    }

    Device::Cpu
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = build_config(&cli)?;
    let device = select_device(cli.gpu);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_flag = stop.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })?;

    let mut trainer = Trainer::new(config, device)?;
    match trainer.run(&stop) {
        Ok(RunOutcome::Completed { iteration }) => {
            info!(iteration, "done");
            Ok(())
        }
        Ok(RunOutcome::Interrupted { iteration }) => {
            info!(iteration, "stopped by interrupt");
            std::process::exit(EXIT_INTERRUPTED);
        }
        Err(e) => {
            error!("training failed: {e:#}");
            Err(e)
        }
    }
}

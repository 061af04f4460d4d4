use anyhow::Result;
use candle_core::{DType, Device, IndexOp, Module, Tensor, Var, D};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::ode::OdeFunc;

// ---------------------------------------------------------------------------
// Gradient-safe ELU: relu(x) + exp(min(x, 0)) - 1, with min(x, 0) = x - relu(x).
// Built from ops whose backward pass is plain arithmetic.
// ---------------------------------------------------------------------------

pub fn grad_elu(x: &Tensor) -> Result<Tensor> {
    let pos = x.relu()?;
    let neg = (x - &pos)?;
    let neg = (neg.exp()? - 1.0)?;
    (pos + neg).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Parameter bundle
// ---------------------------------------------------------------------------

/// The trainable variables of one network, kept in their own `VarMap`.
pub struct ParamSet {
    pub prefix: &'static str,
    pub varmap: VarMap,
}

impl ParamSet {
    fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            varmap: VarMap::new(),
        }
    }

    fn builder(&self, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(&self.varmap, DType::F32, device)
    }

    /// `(prefix.name, var)` pairs sorted by name, so ordering is stable across runs.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap_or_else(|e| e.into_inner());
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (format!("{}.{name}", self.prefix), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        named
    }

    pub fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, v)| v).collect()
    }

    pub fn param_count(&self) -> usize {
        self.vars().iter().map(|v| v.elem_count()).sum()
    }
}

// ---------------------------------------------------------------------------
// Latent dynamics: dz/dt = f(z), three affine layers with ELU in between
// ---------------------------------------------------------------------------

pub struct LatentOdeFunc {
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
}

impl LatentOdeFunc {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.latent_dim, cfg.nhidden, vb.pp("fc1"))?,
            fc2: linear(cfg.nhidden, cfg.nhidden, vb.pp("fc2"))?,
            fc3: linear(cfg.nhidden, cfg.latent_dim, vb.pp("fc3"))?,
        })
    }

    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let h = grad_elu(&self.fc1.forward(z)?)?;
        let h = grad_elu(&self.fc2.forward(&h)?)?;
        self.fc3.forward(&h).map_err(Into::into)
    }
}

impl OdeFunc for LatentOdeFunc {
    fn eval(&self, _t: f64, z: &Tensor) -> Result<Tensor> {
        self.forward(z)
    }
}

// ---------------------------------------------------------------------------
// Recognition RNN: consumes observations newest-first, emits q(z0) params
// ---------------------------------------------------------------------------

/// Diagonal Gaussian over the initial latent state, each `(batch, latent_dim)`.
pub struct Posterior {
    pub mean: Tensor,
    pub logvar: Tensor,
}

pub struct RecognitionRnn {
    i2h: Linear,
    h2o: Linear,
    nhidden: usize,
    latent_dim: usize,
}

impl RecognitionRnn {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            i2h: linear(cfg.obs_dim + cfg.rnn_nhidden, cfg.rnn_nhidden, vb.pp("i2h"))?,
            h2o: linear(cfg.rnn_nhidden, 2 * cfg.latent_dim, vb.pp("h2o"))?,
            nhidden: cfg.rnn_nhidden,
            latent_dim: cfg.latent_dim,
        })
    }

    /// One recurrence: `h' = tanh(i2h([x, h]))`.
    pub fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let combined = Tensor::cat(&[x, h], 1)?;
        self.i2h.forward(&combined)?.tanh().map_err(Into::into)
    }

    pub fn init_hidden(&self, batch: usize, device: &Device) -> Result<Tensor> {
        Tensor::zeros((batch, self.nhidden), DType::F32, device).map_err(Into::into)
    }

    /// `obs`: (batch, time, obs_dim). Runs from the last time step to the
    /// first and reads the posterior off the final hidden state.
    pub fn encode(&self, obs: &Tensor) -> Result<Posterior> {
        let (batch, steps, _) = obs.dims3()?;
        anyhow::ensure!(steps > 0, "recognition network needs at least one observation");
        let mut h = self.init_hidden(batch, obs.device())?;
        for t in (0..steps).rev() {
            let x = obs.i((.., t, ..))?.contiguous()?;
            h = self.step(&x, &h)?;
        }
        let out = self.h2o.forward(&h)?;
        let mean = out.narrow(D::Minus1, 0, self.latent_dim)?;
        let logvar = out.narrow(D::Minus1, self.latent_dim, self.latent_dim)?;
        Ok(Posterior { mean, logvar })
    }
}

// ---------------------------------------------------------------------------
// Decoder: latent -> observation, applied point-wise along a trajectory
// ---------------------------------------------------------------------------

pub struct Decoder {
    fc1: Linear,
    fc2: Linear,
}

impl Decoder {
    pub fn new(cfg: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.latent_dim, cfg.nhidden, vb.pp("fc1"))?,
            fc2: linear(cfg.nhidden, cfg.obs_dim, vb.pp("fc2"))?,
        })
    }

    /// Accepts `(.., latent_dim)` with up to two leading batch dimensions.
    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(z)?.relu()?;
        self.fc2.forward(&h).map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// LatentOde: the three networks and their parameter sets
// ---------------------------------------------------------------------------

pub struct LatentOde {
    pub config: ModelConfig,
    pub func: LatentOdeFunc,
    pub rec: RecognitionRnn,
    pub dec: Decoder,
    pub func_params: ParamSet,
    pub rec_params: ParamSet,
    pub dec_params: ParamSet,
}

impl LatentOde {
    pub fn new(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let func_params = ParamSet::new("func");
        let rec_params = ParamSet::new("rec");
        let dec_params = ParamSet::new("dec");
        let func = LatentOdeFunc::new(&config, func_params.builder(device))?;
        let rec = RecognitionRnn::new(&config, rec_params.builder(device))?;
        let dec = Decoder::new(&config, dec_params.builder(device))?;
        Ok(Self {
            config,
            func,
            rec,
            dec,
            func_params,
            rec_params,
            dec_params,
        })
    }

    pub fn param_sets(&self) -> [&ParamSet; 3] {
        [&self.func_params, &self.rec_params, &self.dec_params]
    }

    /// Joint parameter set of all three networks, prefixed and name-sorted.
    pub fn named_params(&self) -> Vec<(String, Var)> {
        self.param_sets()
            .iter()
            .flat_map(|set| set.named_vars())
            .collect()
    }

    pub fn param_count(&self) -> usize {
        self.param_sets().iter().map(|set| set.param_count()).sum()
    }
}

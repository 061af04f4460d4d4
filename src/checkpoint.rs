use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::data::{tensor_to_times, times_to_tensor, SpiralBatch};
use crate::model::LatentOde;
use crate::optim::Adam;

pub const CHECKPOINT_FILE: &str = "ckpt.safetensors";

const OPTIM_PREFIX: &str = "optim.";
const OPTIM_STEP: &str = "optim.step";
const ITERATION: &str = "train.iteration";

/// What a checkpoint restores besides the parameters and optimizer state,
/// which are loaded in place.
pub struct Restored {
    pub batch: SpiralBatch,
    /// Last completed iteration.
    pub iteration: usize,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write model parameters, optimizer moments, the data batch and the
/// iteration counter to one safetensors file. The file is written next to
/// `path` and renamed into place, so `path` always holds a complete checkpoint.
pub fn save_checkpoint(
    path: &Path,
    model: &LatentOde,
    optimizer: &Adam,
    batch: &SpiralBatch,
    iteration: usize,
) -> Result<()> {
    let mut tensors: HashMap<String, Tensor> = model
        .named_params()
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    let n_params = tensors.len();

    for (name, t) in optimizer.state_tensors() {
        tensors.insert(format!("{OPTIM_PREFIX}{name}"), t);
    }
    tensors.insert(OPTIM_STEP.into(), counter_tensor(optimizer.step_count())?);
    tensors.insert(ITERATION.into(), counter_tensor(iteration)?);

    let cpu = Device::Cpu;
    let t0_idx = batch
        .t0_idx
        .iter()
        .map(|&i| u32::try_from(i))
        .collect::<Result<Vec<u32>, _>>()
        .context("window start index does not fit in u32")?;
    let clockwise: Vec<u8> = batch.clockwise.iter().map(|&cw| u8::from(cw)).collect();
    tensors.insert("data.orig_trajs".into(), batch.orig_trajs.clone());
    tensors.insert("data.samp_trajs".into(), batch.samp_trajs.clone());
    tensors.insert("data.orig_ts".into(), times_to_tensor(&batch.orig_ts, &cpu)?);
    tensors.insert("data.samp_ts".into(), times_to_tensor(&batch.samp_ts, &cpu)?);
    tensors.insert("data.t0_idx".into(), Tensor::from_vec(t0_idx, batch.nspiral(), &cpu)?);
    tensors.insert("data.clockwise".into(), Tensor::from_vec(clockwise, batch.nspiral(), &cpu)?);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating checkpoint directory {}", parent.display()))?;
    }
    let tmp_path = temporary_checkpoint_path(path);
    candle_core::safetensors::save(&tensors, &tmp_path)
        .with_context(|| format!("writing checkpoint {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("moving checkpoint into place at {}", path.display()))?;

    info!(
        path = %path.display(),
        params = n_params,
        iteration,
        "saved checkpoint"
    );
    Ok(())
}

fn temporary_checkpoint_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(CHECKPOINT_FILE);
    path.with_file_name(format!("{file_name}.tmp"))
}

fn counter_tensor(value: usize) -> Result<Tensor> {
    let v = u32::try_from(value).context("counter does not fit in u32")?;
    Tensor::from_vec(vec![v], 1, &Device::Cpu).map_err(Into::into)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Restore a checkpoint written by [`save_checkpoint`]. Parameters and
/// optimizer moments are set in place; every expected key must be present
/// with the shape the model was built with.
pub fn load_checkpoint(
    path: &Path,
    model: &LatentOde,
    optimizer: &mut Adam,
    device: &Device,
) -> Result<Restored> {
    let tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    let get = |key: &str| require(&tensors, path, key);

    let named = model.named_params();
    for (name, var) in &named {
        let saved = get(name.as_str())?;
        anyhow::ensure!(
            saved.shape() == var.shape(),
            "checkpoint tensor {name} has shape {:?}, model expects {:?}",
            saved.dims(),
            var.dims()
        );
        var.set(&saved.to_dtype(var.dtype())?)?;
    }

    let optim_state: HashMap<String, Tensor> = tensors
        .iter()
        .filter_map(|(k, t)| {
            k.strip_prefix(OPTIM_PREFIX)
                .filter(|rest| *rest != "step")
                .map(|rest| (rest.to_string(), t.clone()))
        })
        .collect();
    let step_t = read_counter(get(OPTIM_STEP)?)?;
    optimizer.load_state_tensors(&optim_state, step_t)?;
    let iteration = read_counter(get(ITERATION)?)?;

    let batch = SpiralBatch {
        orig_trajs: get("data.orig_trajs")?.clone(),
        samp_trajs: get("data.samp_trajs")?.clone(),
        orig_ts: tensor_to_times(get("data.orig_ts")?)?,
        samp_ts: tensor_to_times(get("data.samp_ts")?)?,
        t0_idx: get("data.t0_idx")?
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|i| i as usize)
            .collect(),
        clockwise: get("data.clockwise")?
            .to_dtype(DType::U8)?
            .to_vec1::<u8>()?
            .into_iter()
            .map(|b| b != 0)
            .collect(),
    };
    batch
        .validate()
        .with_context(|| format!("checkpoint {} holds an inconsistent batch", path.display()))?;

    info!(
        path = %path.display(),
        params = named.len(),
        iteration,
        "restored checkpoint"
    );
    Ok(Restored { batch, iteration })
}

fn require<'a>(tensors: &'a HashMap<String, Tensor>, path: &Path, key: &str) -> Result<&'a Tensor> {
    tensors
        .get(key)
        .ok_or_else(|| anyhow::anyhow!("checkpoint {} is missing {key}", path.display()))
}

fn read_counter(t: &Tensor) -> Result<usize> {
    let v = t.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
    match v.as_slice() {
        [x] => Ok(*x as usize),
        _ => anyhow::bail!("counter tensor must hold exactly one value, got {}", v.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, SpiralConfig};
    use crate::data::generate_spiral2d;
    use crate::optim::ParamsAdam;
    use candle_nn::Optimizer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup(seed: u64) -> Result<(LatentOde, Adam, SpiralBatch)> {
        let device = Device::Cpu;
        let model = LatentOde::new(ModelConfig::tiny(), &device)?;
        let optimizer = Adam::with_names(model.named_params(), ParamsAdam::default())?;
        let mut rng = StdRng::seed_from_u64(seed);
        let batch = generate_spiral2d(&SpiralConfig::test_spiral(), &mut rng, &device)?;
        Ok((model, optimizer, batch))
    }

    fn flat(model: &LatentOde) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        for (_, v) in model.named_params() {
            out.extend(v.as_tensor().flatten_all()?.to_vec1::<f32>()?);
        }
        Ok(out)
    }

    #[test]
    fn test_roundtrip_restores_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run").join(CHECKPOINT_FILE);
        let (model, mut optimizer, batch) = setup(1)?;

        let z = Tensor::ones((4, 8, 4), DType::F32, &Device::Cpu)?;
        let loss = model.dec.forward(&z)?.sqr()?.sum_all()?;
        optimizer.backward_step(&loss)?;
        save_checkpoint(&path, &model, &optimizer, &batch, 42)?;
        assert!(path.exists());
        assert!(!temporary_checkpoint_path(&path).exists());

        let (fresh, mut fresh_opt, _) = setup(2)?;
        assert_ne!(flat(&fresh)?, flat(&model)?);
        let restored = load_checkpoint(&path, &fresh, &mut fresh_opt, &Device::Cpu)?;

        assert_eq!(flat(&fresh)?, flat(&model)?);
        assert_eq!(restored.iteration, 42);
        assert_eq!(fresh_opt.step_count(), 1);
        let (a, b) = (optimizer.state_tensors(), fresh_opt.state_tensors());
        for (k, t) in &a {
            assert_eq!(
                t.flatten_all()?.to_vec1::<f32>()?,
                b[k].flatten_all()?.to_vec1::<f32>()?,
                "optimizer moment {k}"
            );
        }
        assert_eq!(restored.batch.t0_idx, batch.t0_idx);
        assert_eq!(restored.batch.clockwise, batch.clockwise);
        assert_eq!(restored.batch.orig_ts, batch.orig_ts);
        assert_eq!(restored.batch.samp_ts, batch.samp_ts);
        assert_eq!(
            restored.batch.samp_trajs.to_vec3::<f32>()?,
            batch.samp_trajs.to_vec3::<f32>()?
        );
        assert_eq!(
            restored.batch.orig_trajs.to_vec3::<f32>()?,
            batch.orig_trajs.to_vec3::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_missing_file_is_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (model, mut optimizer, _) = setup(0)?;
        let res = load_checkpoint(&dir.path().join("absent.safetensors"), &model, &mut optimizer, &Device::Cpu);
        assert!(res.is_err());
        Ok(())
    }

    #[test]
    fn test_shape_mismatch_is_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CHECKPOINT_FILE);
        let (model, optimizer, batch) = setup(0)?;
        save_checkpoint(&path, &model, &optimizer, &batch, 0)?;

        let device = Device::Cpu;
        let wider = LatentOde::new(ModelConfig::default_model(), &device)?;
        let mut wider_opt = Adam::with_names(wider.named_params(), ParamsAdam::default())?;
        assert!(load_checkpoint(&path, &wider, &mut wider_opt, &device).is_err());
        Ok(())
    }

    #[test]
    fn test_save_overwrites_previous() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CHECKPOINT_FILE);
        let (model, mut optimizer, batch) = setup(0)?;
        save_checkpoint(&path, &model, &optimizer, &batch, 3)?;
        save_checkpoint(&path, &model, &optimizer, &batch, 9)?;
        let restored = load_checkpoint(&path, &model, &mut optimizer, &Device::Cpu)?;
        assert_eq!(restored.iteration, 9);
        Ok(())
    }
}

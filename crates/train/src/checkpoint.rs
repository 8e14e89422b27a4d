//! Checkpoint I/O.
//!
//! A checkpoint is a single safetensors container:
//!
//! * `model.<param>`: model weights
//! * `optimizer.<param>.exp_avg` / `.exp_avg_sq`: AdamW moments
//! * `__metadata__["mae.checkpoint"]`: JSON with epoch, scaler state,
//!   optimiser group metadata and the run configuration
//!
//! A file without that metadata entry is read as bare model weights.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};

use mae_common::PretrainConfig;

use crate::engine::Engine;
use crate::error::{TrainError, TrainResult};
use crate::optim::OptimizerState;
use crate::scaler::{LossScaler, ScalerState};

pub const CHECKPOINT_META_KEY: &str = "mae.checkpoint";

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";

/// `<dir>/checkpoint-<epoch>.pth`
pub fn checkpoint_path(output_dir: &Path, epoch: usize) -> PathBuf {
    output_dir.join(format!("checkpoint-{epoch}.pth"))
}

/// Checkpoint every `interval` epochs and always after the last one.
pub fn should_checkpoint(epoch: usize, interval: usize, num_epochs: usize) -> bool {
    epoch % interval.max(1) == 0 || epoch + 1 == num_epochs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMeta {
    #[serde(default)]
    epoch: Option<usize>,
    #[serde(default)]
    scaler: Option<ScalerState>,
    #[serde(default)]
    optimizer: Option<serde_json::Value>,
    #[serde(default)]
    config: Option<PretrainConfig>,
}

/// Everything read back from a checkpoint file.
#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub model: HashMap<String, Tensor>,
    pub optimizer: Option<OptimizerState>,
    pub scaler: Option<ScalerState>,
    pub epoch: Option<usize>,
    pub config: Option<PretrainConfig>,
}

impl LoadedCheckpoint {
    /// Carries enough to continue a run, not just initialise weights.
    pub fn is_resumable(&self) -> bool {
        self.optimizer.is_some() && self.epoch.is_some()
    }
}

// ── Save ────────────────────────────────────────────────────────────────────

/// Write model, optimiser, scaler, epoch and config to `path`.
pub fn save_checkpoint<E: Engine>(
    path: &Path,
    engine: &E,
    scaler: &LossScaler,
    epoch: usize,
    config: &PretrainConfig,
) -> TrainResult<()> {
    let optimizer = engine.optimizer_state()?;
    let mut named: Vec<(String, Tensor)> = engine
        .model_state()?
        .into_iter()
        .map(|(n, t)| (format!("{MODEL_PREFIX}{n}"), t))
        .collect();
    named.extend(
        optimizer
            .tensors
            .into_iter()
            .map(|(n, t)| (format!("{OPTIMIZER_PREFIX}{n}"), t)),
    );

    let meta = CheckpointMeta {
        epoch: Some(epoch),
        scaler: Some(scaler.state_dict()),
        optimizer: Some(optimizer.meta),
        config: Some(config.clone()),
    };
    let meta_json =
        serde_json::to_string(&meta).map_err(|e| TrainError::checkpoint(path, e))?;
    let metadata = HashMap::from([(CHECKPOINT_META_KEY.to_string(), meta_json)]);

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    write_tensors(path, &named, Some(metadata))?;
    tracing::info!(path = %path.display(), epoch, "Saved checkpoint");
    Ok(())
}

/// Little-endian f32 bytes for each tensor; views borrow from these.
fn write_tensors(
    path: &Path,
    named: &[(String, Tensor)],
    metadata: Option<HashMap<String, String>>,
) -> TrainResult<()> {
    let mut buffers = Vec::with_capacity(named.len());
    for (name, t) in named {
        let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name.as_str(), t.dims().to_vec(), bytes));
    }
    let mut views = Vec::with_capacity(buffers.len());
    for (name, shape, bytes) in &buffers {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .map_err(|e| TrainError::checkpoint(path, format!("{name}: {e:?}")))?;
        views.push((*name, view));
    }
    safetensors::serialize_to_file(views, metadata, path)
        .map_err(|e| TrainError::checkpoint(path, format!("{e:?}")))
}

// ── Load ────────────────────────────────────────────────────────────────────

pub fn load_checkpoint(path: &Path, device: &Device) -> TrainResult<LoadedCheckpoint> {
    let buffer = std::fs::read(path).map_err(|e| TrainError::checkpoint(path, e))?;
    let (_, header) = SafeTensors::read_metadata(&buffer)
        .map_err(|e| TrainError::checkpoint(path, format!("{e:?}")))?;
    let meta = match header
        .metadata()
        .as_ref()
        .and_then(|m| m.get(CHECKPOINT_META_KEY))
    {
        Some(json) => Some(
            serde_json::from_str::<CheckpointMeta>(json)
                .map_err(|e| TrainError::checkpoint(path, e))?,
        ),
        None => None,
    };

    let st = SafeTensors::deserialize(&buffer)
        .map_err(|e| TrainError::checkpoint(path, format!("{e:?}")))?;
    let mut model = HashMap::new();
    let mut optimizer_tensors = Vec::new();
    for (name, view) in st.tensors() {
        let tensor = view_to_tensor(&view, device).map_err(|e| match e {
            TrainError::Candle(e) => TrainError::checkpoint(path, format!("{name}: {e}")),
            other => other,
        })?;
        if let Some(param) = name.strip_prefix(OPTIMIZER_PREFIX) {
            optimizer_tensors.push((param.to_string(), tensor));
        } else if let Some(param) = name.strip_prefix(MODEL_PREFIX) {
            model.insert(param.to_string(), tensor);
        } else if meta.is_none() {
            model.insert(name, tensor);
        }
    }

    let Some(meta) = meta else {
        return Ok(LoadedCheckpoint {
            model,
            optimizer: None,
            scaler: None,
            epoch: None,
            config: None,
        });
    };
    let optimizer = meta.optimizer.map(|meta| OptimizerState {
        meta,
        tensors: optimizer_tensors,
    });
    Ok(LoadedCheckpoint {
        model,
        optimizer,
        scaler: meta.scaler,
        epoch: meta.epoch,
        config: meta.config,
    })
}

fn view_to_tensor(view: &TensorView<'_>, device: &Device) -> TrainResult<Tensor> {
    let data = view.data();
    let shape = view.shape().to_vec();
    let values: Vec<f32> = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F64 => data
            .chunks_exact(8)
            .map(|b| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                f64::from_le_bytes(raw) as f32
            })
            .collect(),
        other => {
            return Err(TrainError::Candle(candle_core::Error::Msg(format!(
                "unsupported dtype {other:?}"
            ))))
        }
    };
    Ok(Tensor::from_vec(values, shape, device)?)
}

// ── Resume ──────────────────────────────────────────────────────────────────

/// Restore engine (and, for full checkpoints, optimiser and scaler) from
/// `config.resume_address`. Returns the epoch to start from.
pub fn resume_model<E: Engine>(
    config: &PretrainConfig,
    engine: &mut E,
    scaler: &mut LossScaler,
    device: &Device,
) -> TrainResult<usize> {
    if !config.resume {
        return Ok(0);
    }
    let path = config
        .resume_address
        .as_deref()
        .ok_or_else(|| TrainError::Config("RESUME is set but RESUME_ADDRESS is missing".into()))?;

    let ckpt = load_checkpoint(path, device)?;
    engine
        .load_model_state(&ckpt.model)
        .map_err(|e| TrainError::checkpoint(path, e))?;
    tracing::info!(path = %path.display(), "Resumed model weights");

    match (&ckpt.optimizer, ckpt.epoch) {
        (Some(optimizer), Some(epoch)) => {
            engine
                .load_optimizer_state(optimizer)
                .map_err(|e| TrainError::checkpoint(path, e))?;
            if let Some(state) = ckpt.scaler.clone() {
                scaler.load_state_dict(state);
            }
            tracing::info!(epoch, "Restored optimizer and loss scaler state");
            Ok(epoch + 1)
        }
        _ => Ok(config.resume_start_epoch),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

//! Engine: model + optimiser + criterion behind one trait.
//!
//! The training loop only talks to [`Engine`] and [`BatchSource`]; the
//! candle-backed [`CandleEngine`] is the production adapter.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;

use mae_common::{DistContext, ImageBatch, ImageFolderLoader, MaeConfig, PretrainConfig};
use mae_core::{param_stats, MaskedAutoencoderViT};

use crate::error::{TrainError, TrainResult};
use crate::optim::{self, param_groups, AdamW, OptimizerState};

/// Gradient health after unscaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradStats {
    pub norm: f64,
    pub finite: bool,
}

/// What the training loop needs from a model/optimiser bundle.
pub trait Engine {
    type Batch;

    /// Switch to training mode.
    fn train(&mut self);
    /// Switch to evaluation mode.
    fn eval(&mut self);
    /// Drop all accumulated gradients.
    fn zero_grad(&mut self);

    /// Scalar reconstruction loss for `batch`.
    fn forward(&mut self, batch: &Self::Batch, mask_ratio: f64) -> TrainResult<Tensor>;
    /// Backpropagate `loss` and add the gradients to the accumulator.
    fn backward(&mut self, loss: &Tensor) -> TrainResult<()>;

    /// Multiply accumulated gradients by `factor` and report their norm.
    fn unscale_grads(&mut self, factor: f64) -> TrainResult<GradStats>;
    /// Clip accumulated gradients to `max_norm`; returns the pre-clip norm.
    fn clip_grad_norm(&mut self, max_norm: f64) -> TrainResult<f64>;
    /// Apply one optimiser update from the accumulated gradients.
    fn optimizer_step(&mut self) -> TrainResult<()>;

    /// Set the learning rate of every parameter group.
    fn set_learning_rate(&mut self, lr: f64);
    fn learning_rate(&self) -> f64;

    fn model_state(&self) -> TrainResult<Vec<(String, Tensor)>>;
    fn load_model_state(&mut self, tensors: &HashMap<String, Tensor>) -> TrainResult<()>;
    fn optimizer_state(&self) -> TrainResult<OptimizerState>;
    fn load_optimizer_state(&mut self, state: &OptimizerState) -> TrainResult<()>;
}

/// Source of batches for one epoch.
pub trait BatchSource {
    type Batch;

    /// Batches per epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn batches(&self, epoch: usize)
        -> Box<dyn Iterator<Item = anyhow::Result<Self::Batch>> + '_>;
}

impl BatchSource for ImageFolderLoader {
    type Batch = ImageBatch;

    fn len(&self) -> usize {
        ImageFolderLoader::len(self)
    }

    fn batches(&self, epoch: usize) -> Box<dyn Iterator<Item = anyhow::Result<ImageBatch>> + '_> {
        Box::new(self.iter(epoch))
    }
}

// ── CandleEngine ────────────────────────────────────────────────────────────

/// MAE ViT + AdamW on a candle device.
pub struct CandleEngine {
    model: MaskedAutoencoderViT,
    varmap: VarMap,
    params: Vec<(String, Var)>,
    optimizer: AdamW,
    grads: Vec<Option<Tensor>>,
    rng: StdRng,
    device: Device,
    training: bool,
}

impl CandleEngine {
    /// Build model and optimiser. `lr` is the resolved peak rate; masking
    /// draws from a generator seeded with `SEED + rank`.
    pub fn new(
        model_config: &MaeConfig,
        config: &PretrainConfig,
        lr: f64,
        dist: &DistContext,
        device: Device,
    ) -> TrainResult<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = MaskedAutoencoderViT::new(vb, model_config)?;

        let params = named_params(&varmap)?;
        let groups = param_groups(&params, lr, config.weight_decay);
        let optimizer = AdamW::new(params.clone(), groups, (0.9, 0.95))?;

        let stats = param_stats(model_config);
        tracing::info!(
            model = %config.model,
            total_params = stats.total_params,
            encoder_params = stats.encoder_params,
            decoder_params = stats.decoder_params,
            decay_params = optimizer.groups()[0].params.len(),
            no_decay_params = optimizer.groups()[1].params.len(),
            "Model parameter stats"
        );

        let grads = vec![None; params.len()];
        Ok(Self {
            model,
            varmap,
            params,
            optimizer,
            grads,
            rng: StdRng::seed_from_u64(config.seed + dist.rank as u64),
            device,
            training: true,
        })
    }

    pub fn model(&self) -> &MaskedAutoencoderViT {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

/// Parameters sorted by name so ordering is stable across runs.
fn named_params(varmap: &VarMap) -> TrainResult<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| TrainError::Config("parameter map lock poisoned".into()))?;
    let mut params: Vec<(String, Var)> =
        data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(params)
}

impl Engine for CandleEngine {
    type Batch = ImageBatch;

    fn train(&mut self) {
        self.training = true;
    }

    fn eval(&mut self) {
        self.training = false;
    }

    fn zero_grad(&mut self) {
        self.grads.iter_mut().for_each(|g| *g = None);
    }

    fn forward(&mut self, batch: &ImageBatch, mask_ratio: f64) -> TrainResult<Tensor> {
        let (imgs, _labels) = batch.to_tensors(&self.device)?;
        let out = self.model.forward(&imgs, mask_ratio, &mut self.rng)?;
        Ok(out.loss)
    }

    fn backward(&mut self, loss: &Tensor) -> TrainResult<()> {
        let store = loss.backward()?;
        for (slot, (_, var)) in self.grads.iter_mut().zip(&self.params) {
            if let Some(g) = store.get(var.as_tensor()) {
                let g = g.detach();
                *slot = Some(match slot.take() {
                    None => g,
                    Some(prev) => (prev + g)?,
                });
            }
        }
        Ok(())
    }

    fn unscale_grads(&mut self, factor: f64) -> TrainResult<GradStats> {
        optim::scale_grads(&mut self.grads, factor)?;
        let norm = optim::grad_norm(&self.grads)?;
        Ok(GradStats {
            norm,
            finite: norm.is_finite(),
        })
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> TrainResult<f64> {
        Ok(optim::clip_grad_norm(&mut self.grads, max_norm)?)
    }

    fn optimizer_step(&mut self) -> TrainResult<()> {
        Ok(self.optimizer.step(&self.grads)?)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }

    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    /// Detached copies; later optimiser steps do not alter them.
    fn model_state(&self) -> TrainResult<Vec<(String, Tensor)>> {
        self.params
            .iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
            .collect()
    }

    fn load_model_state(&mut self, tensors: &HashMap<String, Tensor>) -> TrainResult<()> {
        for (name, var) in &self.params {
            let t = tensors
                .get(name)
                .ok_or_else(|| TrainError::Config(format!("checkpoint is missing weight {name}")))?;
            if t.dims() != var.dims() {
                return Err(TrainError::Config(format!(
                    "shape mismatch for {name}: model {:?}, checkpoint {:?}",
                    var.dims(),
                    t.dims()
                )));
            }
            var.set(&t.to_device(&self.device)?.to_dtype(DType::F32)?)?;
        }
        Ok(())
    }

    fn optimizer_state(&self) -> TrainResult<OptimizerState> {
        Ok(self.optimizer.state()?)
    }

    fn load_optimizer_state(&mut self, state: &OptimizerState) -> TrainResult<()> {
        Ok(self.optimizer.load_state(state)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

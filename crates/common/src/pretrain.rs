//! Pre-training run configuration.
//!
//! Loaded once from a JSON file whose keys are SCREAMING_SNAKE_CASE
//! (`BATCH_SIZE`, `LEARNING_RATE`, ...). Only `DATAPATH` is required; every
//! other key falls back to the published MAE ViT-L recipe.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::MaeConfig;

/// ImageNet channel statistics.
pub const IMAGENET_DEFAULT_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_DEFAULT_STD: [f32; 3] = [0.229, 0.224, 0.225];

// ── LR decay ────────────────────────────────────────────────────────────────

/// Decay mode after warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrDecay {
    #[default]
    Cosine,
    Linear,
    None,
}

// ── Transforms ──────────────────────────────────────────────────────────────

/// Image preprocessing recipe for one split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Output side length in pixels.
    pub image_size: u32,
    /// `[min, max]` area fraction for a random resized crop. `None` means
    /// resize then centre crop.
    #[serde(default)]
    pub random_resized_crop: Option<[f32; 2]>,
    /// Flip horizontally with probability 0.5.
    #[serde(default)]
    pub horizontal_flip: bool,
    /// Centre-crop fraction used when `random_resized_crop` is `None`.
    #[serde(default = "default_crop_pct")]
    pub crop_pct: f32,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_crop_pct() -> f32 {
    0.875
}
fn default_mean() -> [f32; 3] {
    IMAGENET_DEFAULT_MEAN
}
fn default_std() -> [f32; 3] {
    IMAGENET_DEFAULT_STD
}

impl TransformConfig {
    /// MAE training recipe: RandomResizedCrop(scale 0.2–1.0) + flip.
    pub fn train(image_size: u32) -> Self {
        Self {
            image_size,
            random_resized_crop: Some([0.2, 1.0]),
            horizontal_flip: true,
            crop_pct: default_crop_pct(),
            mean: IMAGENET_DEFAULT_MEAN,
            std: IMAGENET_DEFAULT_STD,
        }
    }

    /// Evaluation recipe: resize + centre crop.
    pub fn val(image_size: u32) -> Self {
        Self {
            image_size,
            random_resized_crop: None,
            horizontal_flip: false,
            crop_pct: default_crop_pct(),
            mean: IMAGENET_DEFAULT_MEAN,
            std: IMAGENET_DEFAULT_STD,
        }
    }
}

fn default_transform_train() -> TransformConfig {
    TransformConfig::train(224)
}
fn default_transform_val() -> TransformConfig {
    TransformConfig::val(224)
}

// ── PretrainConfig ──────────────────────────────────────────────────────────

/// All settings of a pre-training run. Read-only after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct PretrainConfig {
    // ── Optimisation ────────────────────────────────────────────────────────
    /// Images per batch per rank.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Absolute learning rate. When absent it is derived from
    /// `BASE_LEARNING_RATE` and the effective batch size.
    #[serde(default)]
    pub learning_rate: Option<f64>,
    /// Learning rate per 256 images.
    #[serde(default = "default_base_learning_rate")]
    pub base_learning_rate: f64,
    /// Floor of the decay schedule.
    #[serde(default)]
    pub minimum_learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: usize,
    #[serde(default = "default_warmup_epochs")]
    pub warmup_epochs: usize,
    #[serde(default)]
    pub lr_decay: LrDecay,
    /// Micro-batches per optimiser step.
    #[serde(default = "default_accum_iter")]
    pub accum_iter: usize,
    /// Max gradient L2 norm (after unscaling). `None` disables clipping.
    #[serde(default)]
    pub clip_grad: Option<f64>,
    /// Initial loss-scaler scale.
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f64,

    // ── Model ───────────────────────────────────────────────────────────────
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_mask_ratio")]
    pub mask_ratio: f64,
    #[serde(default)]
    pub norm_pix_loss: bool,

    // ── Data ────────────────────────────────────────────────────────────────
    /// Root holding `train/<class>/<image>` and `val/<class>/<image>`.
    pub datapath: PathBuf,
    #[serde(default = "default_transform_train")]
    pub transform_train: TransformConfig,
    #[serde(default = "default_transform_val")]
    pub transform_val: TransformConfig,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,
    /// Build the validation loader from `val/` instead of `train/`.
    #[serde(default)]
    pub validate_on_val_split: bool,
    #[serde(default)]
    pub seed: u64,

    // ── Checkpointing / resume ──────────────────────────────────────────────
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default)]
    pub resume: bool,
    #[serde(default)]
    pub resume_address: Option<PathBuf>,
    #[serde(default)]
    pub resume_start_epoch: usize,

    // ── Reporting ───────────────────────────────────────────────────────────
    /// Run a validation pass every N epochs (0 = never).
    #[serde(default)]
    pub eval_interval: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default)]
    pub verbose: bool,
}

fn default_batch_size() -> usize {
    64
}
fn default_base_learning_rate() -> f64 {
    1.5e-4
}
fn default_weight_decay() -> f64 {
    0.05
}
fn default_num_epochs() -> usize {
    400
}
fn default_warmup_epochs() -> usize {
    40
}
fn default_accum_iter() -> usize {
    1
}
fn default_loss_scale() -> f64 {
    65536.0
}
fn default_model() -> String {
    "mae_vit_large_patch16".to_string()
}
fn default_mask_ratio() -> f64 {
    0.75
}
fn default_num_workers() -> usize {
    4
}
fn default_prefetch_batches() -> usize {
    2
}
fn default_checkpoint_interval() -> usize {
    20
}
fn default_log_interval() -> usize {
    20
}

impl PretrainConfig {
    /// Config with every default and the given data root.
    pub fn with_datapath(datapath: impl Into<PathBuf>) -> Self {
        Self {
            batch_size: default_batch_size(),
            learning_rate: None,
            base_learning_rate: default_base_learning_rate(),
            minimum_learning_rate: 0.0,
            weight_decay: default_weight_decay(),
            num_epochs: default_num_epochs(),
            warmup_epochs: default_warmup_epochs(),
            lr_decay: LrDecay::Cosine,
            accum_iter: default_accum_iter(),
            clip_grad: None,
            loss_scale: default_loss_scale(),
            model: default_model(),
            mask_ratio: default_mask_ratio(),
            norm_pix_loss: false,
            datapath: datapath.into(),
            transform_train: default_transform_train(),
            transform_val: default_transform_val(),
            num_workers: default_num_workers(),
            prefetch_batches: default_prefetch_batches(),
            validate_on_val_split: false,
            seed: 0,
            output_dir: None,
            checkpoint_interval: default_checkpoint_interval(),
            resume: false,
            resume_address: None,
            resume_start_epoch: 0,
            eval_interval: 0,
            log_interval: default_log_interval(),
            verbose: false,
        }
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(config)
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reject settings the training loop cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("BATCH_SIZE must be > 0");
        }
        if self.accum_iter == 0 {
            anyhow::bail!("ACCUM_ITER must be > 0");
        }
        if self.checkpoint_interval == 0 {
            anyhow::bail!("CHECKPOINT_INTERVAL must be > 0");
        }
        if !(0.0..1.0).contains(&self.mask_ratio) {
            anyhow::bail!("MASK_RATIO must be in [0, 1), got {}", self.mask_ratio);
        }
        if self.resume && self.resume_address.is_none() {
            anyhow::bail!("RESUME is set but RESUME_ADDRESS is missing");
        }
        let model = self.model_config()?;
        for (key, t) in [
            ("TRANSFORM_TRAIN", &self.transform_train),
            ("TRANSFORM_VAL", &self.transform_val),
        ] {
            if t.image_size as usize != model.img_size {
                anyhow::bail!(
                    "{key}.image_size ({}) does not match model img_size ({})",
                    t.image_size,
                    model.img_size
                );
            }
        }
        Ok(())
    }

    /// Model hyper-parameters for the configured preset.
    pub fn model_config(&self) -> anyhow::Result<MaeConfig> {
        MaeConfig::from_preset(&self.model, self.norm_pix_loss)
    }

    /// Images consumed per optimiser step across all ranks.
    pub fn effective_batch_size(&self, world_size: usize) -> usize {
        self.batch_size * self.accum_iter * world_size.max(1)
    }

    /// `LEARNING_RATE` if set, else `BASE_LEARNING_RATE · eff_batch / 256`.
    pub fn resolved_learning_rate(&self, world_size: usize) -> f64 {
        self.learning_rate.unwrap_or_else(|| {
            self.base_learning_rate * self.effective_batch_size(world_size) as f64 / 256.0
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_uses_defaults() {
        let c: PretrainConfig = serde_json::from_str(r#"{"DATAPATH": "/data/imagenet"}"#).unwrap();
        assert_eq!(c.datapath, PathBuf::from("/data/imagenet"));
        assert_eq!(c.batch_size, 64);
        assert_eq!(c.accum_iter, 1);
        assert_eq!(c.mask_ratio, 0.75);
        assert_eq!(c.lr_decay, LrDecay::Cosine);
        assert_eq!(c.transform_train.random_resized_crop, Some([0.2, 1.0]));
        assert!(c.transform_val.random_resized_crop.is_none());
        assert!(c.output_dir.is_none());
        assert!(!c.resume);
        c.validate().unwrap();
    }

    #[test]
    fn screaming_snake_case_keys() {
        let json = r#"{
            "DATAPATH": "data",
            "BATCH_SIZE": 8,
            "LEARNING_RATE": 0.001,
            "MINIMUM_LEARNING_RATE": 1e-6,
            "NUM_EPOCHS": 3,
            "WARMUP_EPOCHS": 1,
            "ACCUM_ITER": 4,
            "LR_DECAY": "linear",
            "OUTPUT_DIR": "out",
            "CHECKPOINT_INTERVAL": 2,
            "RESUME": true,
            "RESUME_ADDRESS": "out/checkpoint-1.pth",
            "RESUME_START_EPOCH": 2,
            "VERBOSE": true
        }"#;
        let c: PretrainConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.batch_size, 8);
        assert_eq!(c.learning_rate, Some(0.001));
        assert_eq!(c.accum_iter, 4);
        assert_eq!(c.lr_decay, LrDecay::Linear);
        assert_eq!(c.output_dir, Some(PathBuf::from("out")));
        assert_eq!(c.resume_start_epoch, 2);
        assert!(c.verbose);
    }

    #[test]
    fn missing_datapath_is_an_error() {
        assert!(serde_json::from_str::<PretrainConfig>("{}").is_err());
    }

    #[test]
    fn learning_rate_scales_with_effective_batch() {
        let mut c = PretrainConfig::with_datapath("data");
        c.batch_size = 64;
        c.accum_iter = 2;
        assert_eq!(c.effective_batch_size(2), 256);
        assert!((c.resolved_learning_rate(2) - 1.5e-4).abs() < 1e-12);
        c.learning_rate = Some(1e-3);
        assert_eq!(c.resolved_learning_rate(8), 1e-3);
    }

    #[test]
    fn validate_rejects_bad_settings() {
        let mut c = PretrainConfig::with_datapath("data");
        c.accum_iter = 0;
        assert!(c.validate().is_err());

        let mut c = PretrainConfig::with_datapath("data");
        c.resume = true;
        assert!(c.validate().is_err());

        let mut c = PretrainConfig::with_datapath("data");
        c.mask_ratio = 1.0;
        assert!(c.validate().is_err());

        let mut c = PretrainConfig::with_datapath("data");
        c.model = "mae_vit_tiny_patch8".into();
        assert!(c.validate().is_err(), "224px transforms vs 32px model");
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretrain.json");
        let mut c = PretrainConfig::with_datapath("data");
        c.clip_grad = Some(3.0);
        c.save(&path).unwrap();
        let loaded = PretrainConfig::load(&path).unwrap();
        assert_eq!(loaded, c);
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../config/pretrain.json");
        let c = PretrainConfig::load(&path).unwrap();
        assert_eq!(c.accum_iter, 4);
        assert!(c.norm_pix_loss);
        c.validate().unwrap();
    }
}

//! # mae-train: The Training Engine
//!
//! Training loop, optimiser, loss scaling and checkpointing for MAE
//! pre-training:
//!
//! * **[`Trainer`]**: drives epochs over an [`Engine`]; per-window LR
//!   adjustment, gradient accumulation, divergence detection, checkpoints.
//! * **[`Engine`]**: model + optimiser + criterion behind one trait;
//!   [`CandleEngine`] is the candle adapter.
//! * **[`LrSchedule`]**: warmup → cosine / linear / constant, over
//!   fractional epochs.
//! * **[`LossScaler`]**: dynamic loss scaling with growth / backoff.
//! * **[`AdamW`]**: decoupled weight decay with decay / no-decay groups.

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod optim;
pub mod scaler;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{
    checkpoint_path, load_checkpoint, resume_model, save_checkpoint, should_checkpoint,
    LoadedCheckpoint,
};
pub use engine::{BatchSource, CandleEngine, Engine, GradStats};
pub use error::{TrainError, TrainResult};
pub use optim::{param_groups, AdamW, OptimizerState, ParamGroup};
pub use scaler::{LossScaler, ScalerState, ScalerStep};
pub use scheduler::{epoch_progress, LrSchedule};
pub use trainer::{format_elapsed, EpochStats, RunSummary, Trainer};

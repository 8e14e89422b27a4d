//! Trainer: the epoch / batch loop.
//!
//! Per epoch: `train()`, `zero_grad()`, then for each batch `i`:
//! adjust the learning rate at the start of every accumulation window,
//! forward, bail out on a non-finite loss, scale `loss / ACCUM_ITER` and
//! backward, step + `zero_grad()` when `(i + 1) % ACCUM_ITER == 0`.
//! Checkpoints go to `OUTPUT_DIR` on rank 0 at the configured cadence.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use indicatif::{ProgressBar, ProgressStyle};

use mae_common::{DistContext, PretrainConfig};

use crate::checkpoint::{checkpoint_path, resume_model, save_checkpoint, should_checkpoint};
use crate::engine::{BatchSource, Engine};
use crate::error::{TrainError, TrainResult};
use crate::scaler::{LossScaler, ScalerStep};
use crate::scheduler::{epoch_progress, LrSchedule};

/// Summary of one training epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    pub mean_loss: f64,
    /// Learning rate set at the last window of the epoch.
    pub lr: f64,
    pub loss_scale: f64,
    pub optimizer_steps: usize,
    pub skipped_steps: usize,
    pub val_loss: Option<f64>,
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub start_epoch: usize,
    pub history: Vec<EpochStats>,
    pub checkpoints: Vec<PathBuf>,
    pub elapsed: Duration,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

pub struct Trainer<E: Engine> {
    engine: E,
    scaler: LossScaler,
    schedule: LrSchedule,
    config: PretrainConfig,
    dist: DistContext,
    verbose: bool,
    start_epoch: usize,
}

impl<E: Engine> Trainer<E> {
    /// `verbose` enables the progress bar and per-component detail logs.
    pub fn new(engine: E, config: PretrainConfig, dist: DistContext, verbose: bool) -> Self {
        let lr = config.resolved_learning_rate(dist.world_size);
        let schedule = LrSchedule::from_config(&config, lr);
        let scaler = LossScaler::new(config.loss_scale);
        if verbose && dist.is_main() {
            tracing::info!(
                effective_batch_size = config.effective_batch_size(dist.world_size),
                lr,
                min_lr = config.minimum_learning_rate,
                warmup_epochs = config.warmup_epochs,
                decay = ?config.lr_decay,
                "Learning rate schedule"
            );
        }
        Self {
            engine,
            scaler,
            schedule,
            config,
            dist,
            verbose,
            start_epoch: 0,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn scaler(&self) -> &LossScaler {
        &self.scaler
    }

    pub fn schedule(&self) -> &LrSchedule {
        &self.schedule
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Load `RESUME_ADDRESS` if `RESUME` is set; returns the start epoch.
    pub fn resume(&mut self, device: &Device) -> TrainResult<usize> {
        self.start_epoch = resume_model(&self.config, &mut self.engine, &mut self.scaler, device)?;
        if self.config.resume && self.verbose {
            tracing::info!(
                address = ?self.config.resume_address,
                start_epoch = self.start_epoch,
                "Resume model"
            );
        }
        Ok(self.start_epoch)
    }

    /// Train from the start epoch to `NUM_EPOCHS - 1`.
    pub fn fit<S>(&mut self, train: &S, val: Option<&S>) -> TrainResult<RunSummary>
    where
        S: BatchSource<Batch = E::Batch>,
    {
        let num_epochs = self.config.num_epochs;
        if train.is_empty() && self.dist.is_main() {
            tracing::warn!("Training loader yields no batches; epochs will not update weights");
        }
        if self.dist.is_main() {
            tracing::info!(
                start_epoch = self.start_epoch,
                batches_per_epoch = train.len(),
                "Start pre-training for {num_epochs} epochs"
            );
        }

        let start = Instant::now();
        let mut history = Vec::new();
        let mut checkpoints = Vec::new();
        for epoch in self.start_epoch..num_epochs {
            let mut stats = self.train_one_epoch(train, epoch)?;

            let interval = self.config.eval_interval;
            if let Some(val) = val {
                if interval > 0 && ((epoch + 1) % interval == 0 || epoch + 1 == num_epochs) {
                    stats.val_loss = Some(self.evaluate(val, epoch)?);
                }
            }

            if let Some(dir) = self.config.output_dir.clone() {
                if self.dist.is_main() {
                    if should_checkpoint(epoch, self.config.checkpoint_interval, num_epochs) {
                        let path = checkpoint_path(&dir, epoch);
                        save_checkpoint(&path, &self.engine, &self.scaler, epoch, &self.config)?;
                        checkpoints.push(path);
                    }
                    append_metrics(&dir.join("metrics.csv"), &stats)?;
                }
            }

            if self.dist.is_main() {
                tracing::info!(
                    epoch,
                    loss = stats.mean_loss,
                    lr = stats.lr,
                    loss_scale = stats.loss_scale,
                    val_loss = ?stats.val_loss,
                    "Epoch complete"
                );
            }
            history.push(stats);
        }

        let elapsed = start.elapsed();
        if self.dist.is_main() {
            tracing::info!("Training time {}", format_elapsed(elapsed));
        }
        Ok(RunSummary {
            start_epoch: self.start_epoch,
            history,
            checkpoints,
            elapsed,
        })
    }

    /// One pass over `loader`.
    pub fn train_one_epoch<S>(&mut self, loader: &S, epoch: usize) -> TrainResult<EpochStats>
    where
        S: BatchSource<Batch = E::Batch>,
    {
        let len = loader.len();
        let accum = self.config.accum_iter.max(1);
        let pb = self.progress_bar(len, epoch);

        self.engine.train();
        self.engine.zero_grad();

        let mut loss_sum = 0.0f64;
        let mut seen = 0usize;
        let mut lr = self.engine.learning_rate();
        let mut stepped = 0usize;
        let mut skipped = 0usize;

        for (i, batch) in loader.batches(epoch).enumerate() {
            let batch = batch.map_err(|e| TrainError::DataLoading(format!("{e:#}")))?;

            if i % accum == 0 {
                lr = self.schedule.lr_at(epoch_progress(epoch, i, len));
                self.engine.set_learning_rate(lr);
            }

            let loss = self.engine.forward(&batch, self.config.mask_ratio)?;
            let loss_value = scalar(&loss)?;
            if !loss_value.is_finite() {
                pb.abandon();
                tracing::error!("Loss is {loss_value}, stopping training");
                return Err(TrainError::Divergence {
                    loss: loss_value,
                    epoch,
                    step: i,
                });
            }
            loss_sum += loss_value;
            seen += 1;

            let update = (i + 1) % accum == 0;
            let loss = (loss / accum as f64)?;
            match self
                .scaler
                .scale_and_step(&mut self.engine, &loss, self.config.clip_grad, update)?
            {
                ScalerStep::Accumulated => {}
                ScalerStep::Stepped { .. } => stepped += 1,
                ScalerStep::Skipped { grad_norm } => {
                    skipped += 1;
                    tracing::warn!(epoch, step = i, grad_norm, "Skipped step on non-finite gradients");
                }
            }
            if update {
                self.engine.zero_grad();
            }

            let log_interval = self.config.log_interval;
            if self.dist.is_main() && log_interval > 0 && i % log_interval == 0 {
                tracing::debug!(epoch, step = i, loss = loss_value, lr, "Train");
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        Ok(EpochStats {
            epoch,
            mean_loss: if seen > 0 { loss_sum / seen as f64 } else { 0.0 },
            lr,
            loss_scale: self.scaler.scale(),
            optimizer_steps: stepped,
            skipped_steps: skipped,
            val_loss: None,
        })
    }

    /// Mean masked reconstruction loss over `loader`, in eval mode.
    pub fn evaluate<S>(&mut self, loader: &S, epoch: usize) -> TrainResult<f64>
    where
        S: BatchSource<Batch = E::Batch>,
    {
        self.engine.eval();
        let mut loss_sum = 0.0f64;
        let mut count = 0usize;
        for batch in loader.batches(epoch) {
            let batch = batch.map_err(|e| TrainError::DataLoading(format!("{e:#}")))?;
            let loss = self.engine.forward(&batch, self.config.mask_ratio)?;
            loss_sum += scalar(&loss)?;
            count += 1;
        }
        self.engine.train();
        Ok(if count == 0 {
            f64::NAN
        } else {
            loss_sum / count as f64
        })
    }

    fn progress_bar(&self, len: usize, epoch: usize) -> ProgressBar {
        if !(self.verbose && self.dist.is_main()) {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {prefix} {bar:40} {pos}/{len} batches")
        {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_prefix(format!("epoch {epoch}"));
        pb
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn scalar(loss: &Tensor) -> TrainResult<f64> {
    Ok(loss.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// `H:MM:SS`, hours unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

/// Append one row to `metrics.csv`, writing the header on first use.
fn append_metrics(path: &Path, stats: &EpochStats) -> TrainResult<()> {
    let new_file = !path.exists();
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    if new_file {
        writeln!(f, "epoch,train_loss,lr,loss_scale,optimizer_steps,skipped_steps,val_loss")?;
    }
    let val = stats.val_loss.map(|v| v.to_string()).unwrap_or_default();
    writeln!(
        f,
        "{},{},{},{},{},{},{}",
        stats.epoch,
        stats.mean_loss,
        stats.lr,
        stats.loss_scale,
        stats.optimizer_steps,
        stats.skipped_steps,
        val
    )?;
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

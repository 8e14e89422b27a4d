//! Learning rate schedule over fractional epochs.
//!
//! `t` is measured in epochs (`epoch + i / len(loader)`), so the schedule is
//! independent of dataset size and accumulation window.

use mae_common::{LrDecay, PretrainConfig};

// ── LR Schedule ─────────────────────────────────────────────────────────────

/// Learning rate schedule: linear warmup → cosine / linear / constant decay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrSchedule {
    lr: f64,
    lr_min: f64,
    warmup_epochs: f64,
    num_epochs: f64,
    decay: LrDecay,
}

impl LrSchedule {
    pub fn new(
        lr: f64,
        lr_min: f64,
        warmup_epochs: usize,
        num_epochs: usize,
        decay: LrDecay,
    ) -> Self {
        Self {
            lr,
            lr_min,
            warmup_epochs: warmup_epochs as f64,
            num_epochs: num_epochs as f64,
            decay,
        }
    }

    /// Schedule for a run; `lr` is the resolved peak rate.
    pub fn from_config(config: &PretrainConfig, lr: f64) -> Self {
        Self::new(
            lr,
            config.minimum_learning_rate,
            config.warmup_epochs,
            config.num_epochs,
            config.lr_decay,
        )
    }

    pub fn peak_lr(&self) -> f64 {
        self.lr
    }

    /// Learning rate at fractional epoch `t`.
    pub fn lr_at(&self, t: f64) -> f64 {
        // Warmup phase: linear ramp from 0 to lr.
        if t < self.warmup_epochs {
            return self.lr * t / self.warmup_epochs;
        }

        let span = self.num_epochs - self.warmup_epochs;
        let progress = if span > 0.0 {
            ((t - self.warmup_epochs) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };

        match self.decay {
            LrDecay::Cosine => {
                let cos = (std::f64::consts::PI * progress).cos();
                self.lr_min + (self.lr - self.lr_min) * 0.5 * (1.0 + cos)
            }
            LrDecay::Linear => self.lr - (self.lr - self.lr_min) * progress,
            LrDecay::None => self.lr,
        }
    }
}

/// Fractional epoch for batch `i` of `len` in `epoch`.
pub fn epoch_progress(epoch: usize, i: usize, len: usize) -> f64 {
    epoch as f64 + i as f64 / len.max(1) as f64
}

// ── Tests ───────────────────────────────────────────────────────────────────

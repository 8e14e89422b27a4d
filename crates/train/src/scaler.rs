//! Dynamic loss scaler.
//!
//! Backward runs on `loss · scale`. When an accumulation window closes the
//! gradients are unscaled and checked: a non-finite norm skips the step and
//! backs the scale off; `growth_interval` finite steps in a row grow it.

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::engine::Engine;
use crate::error::TrainResult;

/// Persisted scaler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalerState {
    pub scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
    pub growth_tracker: usize,
}

impl Default for ScalerState {
    fn default() -> Self {
        Self {
            scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
            growth_tracker: 0,
        }
    }
}

/// Outcome of one [`LossScaler::scale_and_step`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalerStep {
    /// Gradients were only accumulated.
    Accumulated,
    /// Optimiser stepped; norm of the unscaled (pre-clip) gradients.
    Stepped { grad_norm: f64 },
    /// Non-finite gradients; step skipped and scale reduced.
    Skipped { grad_norm: f64 },
}

impl ScalerStep {
    pub fn grad_norm(&self) -> Option<f64> {
        match *self {
            ScalerStep::Accumulated => None,
            ScalerStep::Stepped { grad_norm } | ScalerStep::Skipped { grad_norm } => Some(grad_norm),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LossScaler {
    state: ScalerState,
}

impl LossScaler {
    pub fn new(init_scale: f64) -> Self {
        Self {
            state: ScalerState {
                scale: init_scale,
                ..Default::default()
            },
        }
    }

    pub fn scale(&self) -> f64 {
        self.state.scale
    }

    /// Backward on the scaled loss; when `update` is set, unscale, check,
    /// optionally clip to `clip_grad`, and step the optimiser.
    pub fn scale_and_step<E: Engine>(
        &mut self,
        engine: &mut E,
        loss: &Tensor,
        clip_grad: Option<f64>,
        update: bool,
    ) -> TrainResult<ScalerStep> {
        let scaled = (loss * self.state.scale)?;
        engine.backward(&scaled)?;
        if !update {
            return Ok(ScalerStep::Accumulated);
        }

        let stats = engine.unscale_grads(1.0 / self.state.scale)?;
        if !stats.finite {
            self.state.scale *= self.state.backoff_factor;
            self.state.growth_tracker = 0;
            tracing::debug!(scale = self.state.scale, "Non-finite gradients, skipping step");
            return Ok(ScalerStep::Skipped {
                grad_norm: stats.norm,
            });
        }

        if let Some(max_norm) = clip_grad {
            engine.clip_grad_norm(max_norm)?;
        }
        engine.optimizer_step()?;

        self.state.growth_tracker += 1;
        if self.state.growth_tracker >= self.state.growth_interval {
            self.state.scale *= self.state.growth_factor;
            self.state.growth_tracker = 0;
        }
        Ok(ScalerStep::Stepped {
            grad_norm: stats.norm,
        })
    }

    pub fn state_dict(&self) -> ScalerState {
        self.state.clone()
    }

    pub fn load_state_dict(&mut self, state: ScalerState) {
        self.state = state;
    }
}

impl Default for LossScaler {
    fn default() -> Self {
        Self {
            state: ScalerState::default(),
        }
    }
}

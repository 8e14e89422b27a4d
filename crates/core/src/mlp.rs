//! Transformer feed-forward sub-layer.
//!
//! ```text
//! out = fc2( GELU( fc1(x) ) )
//! ```
//!
//! GELU is the exact (erf) form.

use candle_core::{Result, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};

pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(dim, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, dim, vb.pp("fc2"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.fc1.forward(x)?.gelu_erf()?;
        self.fc2.forward(&h)
    }
}

/// Hidden width for a block of width `dim`.
#[inline]
pub fn hidden_dim(dim: usize, mlp_ratio: f64) -> usize {
    (dim as f64 * mlp_ratio) as usize
}

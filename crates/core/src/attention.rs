//! Bidirectional multi-head self-attention.
//!
//! Fused Q/K/V projection (3 × dim, with bias) followed by an output
//! projection. No causal mask: every visible token attends to every other.

use candle_core::{IndexOp, Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

/// Multi-head self-attention over `(batch, tokens, dim)`.
pub struct Attention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    pub fn new(dim: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if num_heads == 0 || dim % num_heads != 0 {
            return Err(candle_core::Error::Msg(format!(
                "dim ({dim}) must be divisible by num_heads ({num_heads})"
            )));
        }
        let head_dim = dim / num_heads;
        Ok(Self {
            qkv: linear(dim, 3 * dim, vb.pp("qkv"))?,
            proj: linear(dim, dim, vb.pp("proj"))?,
            num_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;

        let qkv = self.qkv.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.num_heads, self.head_dim))?;
        let qkv = qkv.permute((2, 0, 3, 1, 4))?; // (3, b, heads, t, head_dim)

        let q = qkv.i(0)?.contiguous()?;
        let k = qkv.i(1)?.contiguous()?;
        let v = qkv.i(2)?.contiguous()?;

        let scores = (q.matmul(&k.t()?)? * self.scale)?;
        let att = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.reshape((b, t, c))?;

        self.proj.forward(&y)
    }
}

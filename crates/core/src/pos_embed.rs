//! Fixed 2-D sine-cosine position embeddings.
//!
//! For a patch at row `i`, column `j` the first half of the embedding
//! encodes `j`, the second half encodes `i`; each half is
//! `[sin(pos·ω_k), cos(pos·ω_k)]` with `ω_k = 10000^{-k/(d/4)}`.

use candle_core::{Device, Result, Tensor};

/// 1-D embedding of `positions`, `dim` values each (`dim` even).
fn sincos_1d(dim: usize, positions: &[f64]) -> Vec<Vec<f32>> {
    let half = dim / 2;
    let omega: Vec<f64> = (0..half)
        .map(|k| 1.0 / 10000f64.powf(k as f64 / half as f64))
        .collect();
    positions
        .iter()
        .map(|&pos| {
            let mut row = Vec::with_capacity(dim);
            row.extend(omega.iter().map(|w| (pos * w).sin() as f32));
            row.extend(omega.iter().map(|w| (pos * w).cos() as f32));
            row
        })
        .collect()
}

/// Row-major `(grid² [+1], dim)` table; a zero row is prepended when
/// `cls_token` is set.
pub fn sincos_2d(dim: usize, grid_size: usize, cls_token: bool) -> Vec<f32> {
    assert!(dim % 4 == 0, "embed dim ({dim}) must be divisible by 4");
    let n = grid_size * grid_size;
    let cols: Vec<f64> = (0..n).map(|p| (p % grid_size) as f64).collect();
    let rows: Vec<f64> = (0..n).map(|p| (p / grid_size) as f64).collect();
    let emb_w = sincos_1d(dim / 2, &cols);
    let emb_h = sincos_1d(dim / 2, &rows);

    let mut out = Vec::with_capacity((n + cls_token as usize) * dim);
    if cls_token {
        out.extend(std::iter::repeat(0f32).take(dim));
    }
    for (w, h) in emb_w.iter().zip(emb_h.iter()) {
        out.extend_from_slice(w);
        out.extend_from_slice(h);
    }
    out
}

/// Non-trainable `(1, grid² + 1, dim)` embedding tensor (with class slot).
pub fn sincos_2d_tensor(dim: usize, grid_size: usize, device: &Device) -> Result<Tensor> {
    let n = grid_size * grid_size + 1;
    Tensor::from_vec(sincos_2d(dim, grid_size, true), (1, n, dim), device)
}

//! Patch embedding and patch <-> image reshaping.

use candle_core::{Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, Module, VarBuilder};

/// Non-overlapping `p × p` convolution: `(B, C, H, W)` → `(B, L, dim)`.
pub struct PatchEmbed {
    proj: Conv2d,
}

impl PatchEmbed {
    pub fn new(in_chans: usize, dim: usize, patch_size: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: patch_size,
            ..Default::default()
        };
        Ok(Self {
            proj: conv2d(in_chans, dim, patch_size, cfg, vb.pp("proj"))?,
        })
    }

    pub fn forward(&self, imgs: &Tensor) -> Result<Tensor> {
        // (B, dim, h, w) -> (B, h·w, dim)
        self.proj.forward(imgs)?.flatten_from(2)?.transpose(1, 2)
    }
}

/// `(N, C, H, W)` → `(N, L, p²·C)`, patch values ordered `(p, q, c)`.
pub fn patchify(imgs: &Tensor, p: usize) -> Result<Tensor> {
    let (n, c, h, w) = imgs.dims4()?;
    if h != w || h % p != 0 {
        return Err(candle_core::Error::Msg(format!(
            "patchify expects square images divisible by {p}, got {h}x{w}"
        )));
    }
    let g = h / p;
    imgs.reshape(vec![n, c, g, p, g, p])?
        .permute([0usize, 2, 4, 3, 5, 1])?
        .reshape((n, g * g, p * p * c))
}

/// Inverse of [`patchify`]: `(N, L, p²·C)` → `(N, C, H, W)`.
pub fn unpatchify(x: &Tensor, p: usize, in_chans: usize) -> Result<Tensor> {
    let (n, l, _) = x.dims3()?;
    let g = (l as f64).sqrt() as usize;
    if g * g != l {
        return Err(candle_core::Error::Msg(format!(
            "unpatchify expects a square number of patches, got {l}"
        )));
    }
    x.reshape(vec![n, g, g, p, p, in_chans])?
        .permute([0usize, 5, 1, 3, 2, 4])?
        .reshape((n, in_chans, g * p, g * p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn unpatchify_inverts_patchify() {
        let imgs = Tensor::arange(0f32, 2.0 * 3.0 * 8.0 * 8.0, &Device::Cpu)
            .unwrap()
            .reshape((2, 3, 8, 8))
            .unwrap();
        let patches = patchify(&imgs, 4).unwrap();
        assert_eq!(patches.dims(), &[2, 4, 48]);
        let back = unpatchify(&patches, 4, 3).unwrap();
        let diff = (back - &imgs)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn first_patch_holds_top_left_pixels() {
        // single channel-major image: value = y * 4 + x on every channel
        let data: Vec<f32> = (0..3).flat_map(|_| (0..16).map(|v| v as f32)).collect();
        let imgs = Tensor::from_vec(data, (1, 3, 4, 4), &Device::Cpu).unwrap();
        let patches = patchify(&imgs, 2).unwrap().to_vec3::<f32>().unwrap();
        // (p, q, c) order: (0,0)x3, (0,1)x3, (1,0)x3, (1,1)x3
        assert_eq!(
            patches[0][0],
            vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 4.0, 4.0, 4.0, 5.0, 5.0, 5.0]
        );
    }
}

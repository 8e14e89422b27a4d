//! Per-sample random patch masking.
//!
//! Each sample gets an independent random permutation of its `L` patches;
//! the first `L · (1 − mask_ratio)` (truncated) are kept. The plan is
//! drawn on the host so masking is reproducible from the caller's RNG.

use candle_core::{DType, Device, Result, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

/// Indices describing one masking draw for a batch.
#[derive(Debug, Clone)]
pub struct MaskPlan {
    /// Kept patch indices, `(B, len_keep)` `u32`.
    pub ids_keep: Tensor,
    /// Inverse permutation, `(B, L)` `u32`.
    pub ids_restore: Tensor,
    /// `(B, L)` `f32`: 0 = kept, 1 = removed.
    pub mask: Tensor,
    pub len_keep: usize,
}

/// Patches kept out of `num_patches` for `mask_ratio`.
pub fn len_keep(num_patches: usize, mask_ratio: f64) -> usize {
    (num_patches as f64 * (1.0 - mask_ratio)) as usize
}

pub fn random_masking_plan(
    batch: usize,
    num_patches: usize,
    mask_ratio: f64,
    rng: &mut impl Rng,
    device: &Device,
) -> Result<MaskPlan> {
    let keep = len_keep(num_patches, mask_ratio);
    let mut ids_keep = Vec::with_capacity(batch * keep);
    let mut ids_restore = vec![0u32; batch * num_patches];
    let mut mask = vec![0f32; batch * num_patches];

    let mut shuffle: Vec<u32> = (0..num_patches as u32).collect();
    for b in 0..batch {
        shuffle.shuffle(rng);
        ids_keep.extend_from_slice(&shuffle[..keep]);
        let row = b * num_patches;
        for (rank, &patch) in shuffle.iter().enumerate() {
            ids_restore[row + patch as usize] = rank as u32;
            if rank >= keep {
                mask[row + patch as usize] = 1.0;
            }
        }
    }

    Ok(MaskPlan {
        ids_keep: Tensor::from_vec(ids_keep, (batch, keep), device)?,
        ids_restore: Tensor::from_vec(ids_restore, (batch, num_patches), device)?,
        mask: Tensor::from_vec(mask, (batch, num_patches), device)?,
        len_keep: keep,
    })
}

/// Gather rows of `x: (B, L, D)` along dim 1 with `ids: (B, N)`.
pub fn gather_tokens(x: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let (b, _, d) = x.dims3()?;
    let n = ids.dim(1)?;
    let idx = ids
        .to_dtype(DType::U32)?
        .unsqueeze(2)?
        .broadcast_as((b, n, d))?
        .contiguous()?;
    x.contiguous()?.gather(&idx, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn keeps_truncated_fraction() {
        assert_eq!(len_keep(196, 0.75), 49);
        assert_eq!(len_keep(16, 0.75), 4);
        assert_eq!(len_keep(10, 0.0), 10);
    }

    #[test]
    fn mask_counts_and_restore_are_consistent() {
        let mut rng = StdRng::seed_from_u64(11);
        let plan = random_masking_plan(3, 16, 0.75, &mut rng, &Device::Cpu).unwrap();
        let mask = plan.mask.to_vec2::<f32>().unwrap();
        let keep = plan.ids_keep.to_vec2::<u32>().unwrap();
        let restore = plan.ids_restore.to_vec2::<u32>().unwrap();
        for b in 0..3 {
            assert_eq!(mask[b].iter().filter(|&&m| m == 0.0).count(), 4);
            for &k in &keep[b] {
                assert_eq!(mask[b][k as usize], 0.0);
                assert!(restore[b][k as usize] < 4);
            }
            let mut r = restore[b].clone();
            r.sort_unstable();
            assert_eq!(r, (0..16).collect::<Vec<u32>>());
        }
    }

    #[test]
    fn gather_then_restore_is_identity_on_kept_rows() {
        let x = Tensor::arange(0f32, 24.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 6, 4))
            .unwrap();
        let ids = Tensor::new(&[[4u32, 1]], &Device::Cpu).unwrap();
        let g = gather_tokens(&x, &ids).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(g[0][0], vec![16.0, 17.0, 18.0, 19.0]);
        assert_eq!(g[0][1], vec![4.0, 5.0, 6.0, 7.0]);
    }
}

//! Masked autoencoder with a ViT backbone.
//!
//! Encoder sees only the visible patches (plus a class token); the
//! lightweight decoder sees the full sequence with learned mask tokens in
//! the removed slots and regresses raw (or per-patch normalised) pixels.
//! Position embeddings are fixed sin-cos tables, not parameters.

use candle_core::{DType, IndexOp, Result, Tensor, D};
use candle_nn::{linear, Init, Linear, Module, VarBuilder};
use rand::Rng;

use mae_common::MaeConfig;

use crate::attention::Attention;
use crate::masking::{gather_tokens, random_masking_plan};
use crate::mlp::{hidden_dim, Mlp};
use crate::norm::LayerNorm;
use crate::patch::{patchify, PatchEmbed};
use crate::pos_embed::sincos_2d_tensor;

// ── Transformer Block ───────────────────────────────────────────────────────

/// Pre-norm block: `x + attn(norm1(x))`, then `x + mlp(norm2(x))`.
struct Block {
    norm1: LayerNorm,
    attn: Attention,
    norm2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(dim: usize, num_heads: usize, config: &MaeConfig, vb: VarBuilder) -> Result<Self> {
        let eps = config.layer_norm_eps;
        Ok(Self {
            norm1: LayerNorm::new(dim, eps, vb.pp("norm1"))?,
            attn: Attention::new(dim, num_heads, vb.pp("attn"))?,
            norm2: LayerNorm::new(dim, eps, vb.pp("norm2"))?,
            mlp: Mlp::new(dim, hidden_dim(dim, config.mlp_ratio), vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.norm1.forward(x)?)?)?;
        let h = self.mlp.forward(&self.norm2.forward(&x)?)?;
        x + h
    }
}

// ── Output ──────────────────────────────────────────────────────────────────

/// Result of one forward pass.
pub struct MaeOutput {
    /// Scalar mean reconstruction loss over removed patches.
    pub loss: Tensor,
    /// `(B, L, p²·C)` predicted patches.
    pub pred: Tensor,
    /// `(B, L)`: 0 = kept, 1 = removed.
    pub mask: Tensor,
}

// ── MaskedAutoencoderViT ────────────────────────────────────────────────────

pub struct MaskedAutoencoderViT {
    patch_embed: PatchEmbed,
    cls_token: Tensor,
    pos_embed: Tensor,
    blocks: Vec<Block>,
    norm: LayerNorm,

    decoder_embed: Linear,
    mask_token: Tensor,
    decoder_pos_embed: Tensor,
    decoder_blocks: Vec<Block>,
    decoder_norm: LayerNorm,
    decoder_pred: Linear,

    config: MaeConfig,
}

impl MaskedAutoencoderViT {
    pub fn new(vb: VarBuilder, config: &MaeConfig) -> Result<Self> {
        let grid = config.grid_size();
        let device = vb.device().clone();
        let token_init = Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        };

        let patch_embed = PatchEmbed::new(
            config.in_chans,
            config.embed_dim,
            config.patch_size,
            vb.pp("patch_embed"),
        )?;
        let cls_token = vb.get_with_hints((1, 1, config.embed_dim), "cls_token", token_init)?;
        let pos_embed = sincos_2d_tensor(config.embed_dim, grid, &device)?;

        let mut blocks = Vec::with_capacity(config.depth);
        for i in 0..config.depth {
            blocks.push(Block::new(
                config.embed_dim,
                config.num_heads,
                config,
                vb.pp(format!("blocks.{i}")),
            )?);
        }
        let norm = LayerNorm::new(config.embed_dim, config.layer_norm_eps, vb.pp("norm"))?;

        let decoder_embed = linear(
            config.embed_dim,
            config.decoder_embed_dim,
            vb.pp("decoder_embed"),
        )?;
        let mask_token =
            vb.get_with_hints((1, 1, config.decoder_embed_dim), "mask_token", token_init)?;
        let decoder_pos_embed = sincos_2d_tensor(config.decoder_embed_dim, grid, &device)?;

        let mut decoder_blocks = Vec::with_capacity(config.decoder_depth);
        for i in 0..config.decoder_depth {
            decoder_blocks.push(Block::new(
                config.decoder_embed_dim,
                config.decoder_num_heads,
                config,
                vb.pp(format!("decoder_blocks.{i}")),
            )?);
        }
        let decoder_norm = LayerNorm::new(
            config.decoder_embed_dim,
            config.layer_norm_eps,
            vb.pp("decoder_norm"),
        )?;
        let decoder_pred = linear(
            config.decoder_embed_dim,
            config.patch_dim(),
            vb.pp("decoder_pred"),
        )?;

        Ok(Self {
            patch_embed,
            cls_token,
            pos_embed,
            blocks,
            norm,
            decoder_embed,
            mask_token,
            decoder_pos_embed,
            decoder_blocks,
            decoder_norm,
            decoder_pred,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &MaeConfig {
        &self.config
    }

    /// Encode visible patches. Returns `(latent, mask, ids_restore)`.
    pub fn forward_encoder(
        &self,
        imgs: &Tensor,
        mask_ratio: f64,
        rng: &mut impl Rng,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let x = self.patch_embed.forward(imgs)?;
        let (b, l, d) = x.dims3()?;
        let x = x.broadcast_add(&self.pos_embed.i((.., 1.., ..))?)?;

        let plan = random_masking_plan(b, l, mask_ratio, rng, x.device())?;
        let x = gather_tokens(&x, &plan.ids_keep)?;

        let cls = (&self.cls_token + self.pos_embed.i((.., ..1, ..))?)?;
        let cls = cls.broadcast_as((b, 1, d))?;
        let mut x = Tensor::cat(&[&cls, &x], 1)?;

        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let x = self.norm.forward(&x)?;
        Ok((x, plan.mask, plan.ids_restore))
    }

    /// Decode the full sequence; returns `(B, L, p²·C)` predictions.
    pub fn forward_decoder(&self, latent: &Tensor, ids_restore: &Tensor) -> Result<Tensor> {
        let x = self.decoder_embed.forward(latent)?;
        let (b, t, d) = x.dims3()?;
        let l = ids_restore.dim(1)?;

        let visible = x.i((.., 1.., ..))?;
        let mask_tokens = self.mask_token.broadcast_as((b, l + 1 - t, d))?;
        let full = Tensor::cat(&[&visible, &mask_tokens], 1)?;
        let full = gather_tokens(&full, ids_restore)?;
        let mut x = Tensor::cat(&[&x.i((.., ..1, ..))?, &full], 1)?;
        x = x.broadcast_add(&self.decoder_pos_embed)?;

        for block in &self.decoder_blocks {
            x = block.forward(&x)?;
        }
        let x = self.decoder_norm.forward(&x)?;
        let x = self.decoder_pred.forward(&x)?;
        x.i((.., 1.., ..))
    }

    /// Mean squared error per patch, averaged over removed patches.
    pub fn forward_loss(&self, imgs: &Tensor, pred: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mut target = patchify(imgs, self.config.patch_size)?;
        if self.config.norm_pix_loss {
            let mean = target.mean_keepdim(D::Minus1)?;
            let var = target.var_keepdim(D::Minus1)?;
            target = target
                .broadcast_sub(&mean)?
                .broadcast_div(&(var + 1e-6)?.sqrt()?)?;
        }
        let per_patch = (pred - target)?.sqr()?.mean(D::Minus1)?;
        let removed = mask.sum_all()?.maximum(1f32)?;
        (per_patch * mask)?.sum_all()?.div(&removed)
    }

    pub fn forward(&self, imgs: &Tensor, mask_ratio: f64, rng: &mut impl Rng) -> Result<MaeOutput> {
        let imgs = imgs.to_dtype(DType::F32)?;
        let (latent, mask, ids_restore) = self.forward_encoder(&imgs, mask_ratio, rng)?;
        let pred = self.forward_decoder(&latent, &ids_restore)?;
        let loss = self.forward_loss(&imgs, &pred, &mask)?;
        Ok(MaeOutput { loss, pred, mask })
    }
}

// ── Parameter Stats ─────────────────────────────────────────────────────────

/// Trainable parameter counts, split by encoder / decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamStats {
    pub encoder_params: usize,
    pub decoder_params: usize,
    pub total_params: usize,
}

fn block_params(dim: usize, mlp_ratio: f64) -> usize {
    let hidden = hidden_dim(dim, mlp_ratio);
    let norms = 2 * (2 * dim);
    let attn = dim * 3 * dim + 3 * dim + dim * dim + dim;
    let mlp = dim * hidden + hidden + hidden * dim + dim;
    norms + attn + mlp
}

/// Pure arithmetic from the config; no model instance needed.
pub fn param_stats(config: &MaeConfig) -> ParamStats {
    let d = config.embed_dim;
    let dd = config.decoder_embed_dim;
    let p = config.patch_size;

    let patch_embed = p * p * config.in_chans * d + d;
    let encoder = patch_embed
        + d // cls_token
        + config.depth * block_params(d, config.mlp_ratio)
        + 2 * d; // norm

    let decoder = d * dd + dd // decoder_embed
        + dd // mask_token
        + config.decoder_depth * block_params(dd, config.mlp_ratio)
        + 2 * dd // decoder_norm
        + dd * config.patch_dim() + config.patch_dim();

    ParamStats {
        encoder_params: encoder,
        decoder_params: decoder,
        total_params: encoder + decoder,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny(norm_pix_loss: bool) -> (VarMap, MaskedAutoencoderViT) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = MaskedAutoencoderViT::new(vb, &MaeConfig::vit_tiny_patch8(norm_pix_loss)).unwrap();
        (varmap, model)
    }

    #[test]
    fn param_stats_match_varmap() {
        let (varmap, model) = tiny(false);
        let counted: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        assert_eq!(param_stats(model.config()).total_params, counted);
    }

    #[test]
    fn forward_shapes_and_finite_loss() {
        let (_varmap, model) = tiny(true);
        let imgs = Tensor::randn(0f32, 1.0, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let out = model.forward(&imgs, 0.75, &mut rng).unwrap();
        assert_eq!(out.pred.dims(), &[2, 16, 192]);
        assert_eq!(out.mask.dims(), &[2, 16]);
        let masked: f32 = out.mask.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(masked, 2.0 * 12.0);
        let loss: f32 = out.loss.to_scalar().unwrap();
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn loss_only_counts_removed_patches() {
        let (_varmap, model) = tiny(false);
        let imgs = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let pred = Tensor::zeros((1, 16, 192), DType::F32, &Device::Cpu).unwrap();
        // error of 1.0 on every value of patch 0 only
        let mut bump = vec![0f32; 16 * 192];
        bump[..192].iter_mut().for_each(|v| *v = 1.0);
        let pred = (pred + Tensor::from_vec(bump, (1, 16, 192), &Device::Cpu).unwrap()).unwrap();

        let mut m = vec![0f32; 16];
        m[0] = 1.0;
        m[1] = 1.0;
        let mask = Tensor::from_vec(m, (1, 16), &Device::Cpu).unwrap();
        let loss: f32 = model.forward_loss(&imgs, &pred, &mask).unwrap().to_scalar().unwrap();
        assert!((loss - 0.5).abs() < 1e-6);

        let kept_only = Tensor::zeros((1, 16), DType::F32, &Device::Cpu).unwrap();
        let loss: f32 = model
            .forward_loss(&imgs, &pred, &kept_only)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn every_parameter_receives_a_gradient() {
        let (varmap, model) = tiny(false);
        let imgs = Tensor::randn(0f32, 1.0, (1, 3, 32, 32), &Device::Cpu).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let out = model.forward(&imgs, 0.5, &mut rng).unwrap();
        let grads = out.loss.backward().unwrap();
        let data = varmap.data().lock().unwrap();
        assert!(data.contains_key("blocks.0.norm1.weight"));
        for (name, var) in data.iter() {
            assert!(grads.get(var.as_tensor()).is_some(), "no grad for {name}");
        }
    }
}

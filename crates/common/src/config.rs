//! Model configuration for the masked autoencoder.
//!
//! Named presets cover the usual ViT sizes. As JSON, the encoder and
//! decoder widths are required; patch geometry and the rest default to
//! ViT-Large/16 values.

use serde::{Deserialize, Serialize};

/// Hyper-parameters of the MAE vision transformer (encoder + decoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaeConfig {
    // ── Patch embedding ─────────────────────────────────────────────────────
    /// Input image side length (images are square).
    #[serde(default = "default_img_size")]
    pub img_size: usize,
    /// Patch side length; `img_size` must be divisible by it.
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    /// Number of input channels.
    #[serde(default = "default_in_chans")]
    pub in_chans: usize,

    // ── Encoder ─────────────────────────────────────────────────────────────
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,

    // ── Decoder ─────────────────────────────────────────────────────────────
    pub decoder_embed_dim: usize,
    pub decoder_depth: usize,
    pub decoder_num_heads: usize,

    /// MLP hidden size as a multiple of the block width.
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,

    /// Normalise each target patch by its own mean/variance before the loss.
    #[serde(default)]
    pub norm_pix_loss: bool,
}

fn default_img_size() -> usize {
    224
}
fn default_patch_size() -> usize {
    16
}
fn default_in_chans() -> usize {
    3
}
fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_layer_norm_eps() -> f64 {
    1e-6
}

impl Default for MaeConfig {
    fn default() -> Self {
        Self::vit_large_patch16(false)
    }
}

impl MaeConfig {
    /// Tiny preset for smoke tests and CPU debugging.
    pub fn vit_tiny_patch8(norm_pix_loss: bool) -> Self {
        Self {
            img_size: 32,
            patch_size: 8,
            in_chans: 3,
            embed_dim: 32,
            depth: 2,
            num_heads: 2,
            decoder_embed_dim: 16,
            decoder_depth: 1,
            decoder_num_heads: 2,
            mlp_ratio: 2.0,
            layer_norm_eps: 1e-6,
            norm_pix_loss,
        }
    }

    pub fn vit_base_patch16(norm_pix_loss: bool) -> Self {
        Self {
            img_size: 224,
            patch_size: 16,
            in_chans: 3,
            embed_dim: 768,
            depth: 12,
            num_heads: 12,
            decoder_embed_dim: 512,
            decoder_depth: 8,
            decoder_num_heads: 16,
            mlp_ratio: 4.0,
            layer_norm_eps: 1e-6,
            norm_pix_loss,
        }
    }

    pub fn vit_large_patch16(norm_pix_loss: bool) -> Self {
        Self {
            embed_dim: 1024,
            depth: 24,
            num_heads: 16,
            ..Self::vit_base_patch16(norm_pix_loss)
        }
    }

    pub fn vit_huge_patch14(norm_pix_loss: bool) -> Self {
        Self {
            patch_size: 14,
            embed_dim: 1280,
            depth: 32,
            num_heads: 16,
            ..Self::vit_base_patch16(norm_pix_loss)
        }
    }

    /// Resolve a preset by name (`mae_vit_large_patch16`, ...).
    pub fn from_preset(name: &str, norm_pix_loss: bool) -> anyhow::Result<Self> {
        match name {
            "mae_vit_tiny_patch8" => Ok(Self::vit_tiny_patch8(norm_pix_loss)),
            "mae_vit_base_patch16" => Ok(Self::vit_base_patch16(norm_pix_loss)),
            "mae_vit_large_patch16" => Ok(Self::vit_large_patch16(norm_pix_loss)),
            "mae_vit_huge_patch14" => Ok(Self::vit_huge_patch14(norm_pix_loss)),
            other => anyhow::bail!("unknown model preset '{other}'"),
        }
    }

    /// Patches per side (`img_size / patch_size`). Panics if not divisible.
    pub fn grid_size(&self) -> usize {
        assert!(
            self.img_size % self.patch_size == 0,
            "img_size ({}) must be divisible by patch_size ({})",
            self.img_size,
            self.patch_size,
        );
        self.img_size / self.patch_size
    }

    /// Total number of patches per image.
    pub fn num_patches(&self) -> usize {
        let g = self.grid_size();
        g * g
    }

    /// Values per patch (`patch_size² · in_chans`).
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.in_chans
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_preset_dimensions() {
        let c = MaeConfig::vit_large_patch16(true);
        assert_eq!(c.embed_dim, 1024);
        assert_eq!(c.depth, 24);
        assert_eq!(c.decoder_embed_dim, 512);
        assert_eq!(c.num_patches(), 196);
        assert_eq!(c.patch_dim(), 768);
        assert!(c.norm_pix_loss);
    }

    #[test]
    fn huge_preset_uses_patch14() {
        let c = MaeConfig::from_preset("mae_vit_huge_patch14", false).unwrap();
        assert_eq!(c.patch_size, 14);
        assert_eq!(c.grid_size(), 16);
    }

    #[test]
    fn unknown_preset_is_rejected() {
        assert!(MaeConfig::from_preset("vit_giant", false).is_err());
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let json = r#"{
            "embed_dim": 64,
            "depth": 2,
            "num_heads": 4,
            "decoder_embed_dim": 32,
            "decoder_depth": 1,
            "decoder_num_heads": 4
        }"#;
        let c: MaeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(c.img_size, 224);
        assert_eq!(c.patch_size, 16);
        assert_eq!(c.mlp_ratio, 4.0);
        assert!(!c.norm_pix_loss);
    }
}

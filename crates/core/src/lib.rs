//! # mae-core: The Model
//!
//! Every compute primitive needed to build and train a masked-autoencoder
//! vision transformer lives in this crate:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`patch`] | `PatchEmbed`, `patchify` / `unpatchify` |
//! | [`pos_embed`] | Fixed 2-D sin-cos position tables |
//! | [`masking`] | Per-sample random masking plans, token gather |
//! | [`attention`] | Bidirectional multi-head self-attention |
//! | [`mlp`] | GELU feed-forward sub-layer |
//! | [`model`] | `MaskedAutoencoderViT`, `ParamStats` |
//! | [`norm`] | Differentiable `LayerNorm` |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Caller-owned randomness.** Masking draws from an RNG passed in, so a
//!    seeded run is reproducible.

pub mod attention;
pub mod masking;
pub mod mlp;
pub mod model;
pub mod norm;
pub mod patch;
pub mod pos_embed;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use masking::{random_masking_plan, MaskPlan};
pub use model::{param_stats, MaeOutput, MaskedAutoencoderViT, ParamStats};
pub use patch::{patchify, unpatchify, PatchEmbed};

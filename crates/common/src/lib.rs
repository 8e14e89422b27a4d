//! # mae-common: Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`MaeConfig`]**: model hyper-parameters and named presets.
//! * **[`PretrainConfig`]**: run settings loaded from a JSON file.
//! * **[`ImageFolder`]** / **[`ImageFolderLoader`]**: image loading & batching.
//! * **[`DistContext`]**: rank / world size of this process.

pub mod config;
pub mod data;
pub mod dist;
pub mod pretrain;

pub use config::MaeConfig;
pub use data::{
    pretrain_loaders, DistributedSampler, ImageBatch, ImageFolder, ImageFolderLoader,
    LoaderConfig, Transform,
};
pub use dist::DistContext;
pub use pretrain::{LrDecay, PretrainConfig, TransformConfig};

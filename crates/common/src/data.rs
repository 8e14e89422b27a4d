//! Data pipeline: image-folder dataset, transforms, sharded batching.
//!
//! Layout on disk is `<root>/<class>/<image>`; class indices follow the
//! sorted directory names. Labels are carried through but the MAE objective
//! never reads them.
//!
//! * **[`ImageFolder`]**: index of `(path, class)` samples under one split.
//! * **[`Transform`]**: crop / resize / flip / normalise into CHW `f32`.
//! * **[`DistributedSampler`]**: epoch-seeded shuffle and per-rank shard.
//! * **[`ImageFolderLoader`]**: batches decoded on a rayon pool inside a
//!   producer thread, handed over through a bounded channel.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result as AnyhowResult};
use candle_core::{Device, Result, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::dist::DistContext;
use crate::pretrain::{PretrainConfig, TransformConfig};

/// File extensions recognised as images (lower-case).
pub const IMG_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "ppm", "bmp", "pgm", "tif", "tiff", "webp",
];

// ── ImageFolder ─────────────────────────────────────────────────────────────

/// Samples of one split, grouped by class directory.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    root: PathBuf,
    classes: Vec<String>,
    samples: Vec<(PathBuf, u32)>,
}

impl ImageFolder {
    /// Scan `root/<class>/<image>`. Fails if no class holds an image.
    pub fn open(root: &Path) -> AnyhowResult<Self> {
        let mut class_dirs: Vec<PathBuf> = std::fs::read_dir(root)
            .with_context(|| format!("read dataset root {}", root.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        class_dirs.sort();

        let mut classes = Vec::with_capacity(class_dirs.len());
        let mut samples = Vec::new();
        for (idx, dir) in class_dirs.iter().enumerate() {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            classes.push(name);
            let mut files = Vec::new();
            collect_images(dir, &mut files)?;
            files.sort();
            samples.extend(files.into_iter().map(|p| (p, idx as u32)));
        }

        if samples.is_empty() {
            anyhow::bail!(
                "found no images under {} (supported: {})",
                root.display(),
                IMG_EXTENSIONS.join(", ")
            );
        }
        Ok(Self {
            root: root.to_path_buf(),
            classes,
            samples,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, index: usize) -> &(PathBuf, u32) {
        &self.samples[index]
    }
}

impl std::fmt::Display for ImageFolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ImageFolder(root={}, classes={}, samples={})",
            self.root.display(),
            self.classes.len(),
            self.samples.len()
        )
    }
}

/// Recursively collect image files below `dir`.
fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> AnyhowResult<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let p = entry?.path();
        if p.is_dir() {
            collect_images(&p, out)?;
        } else if is_image_file(&p) {
            out.push(p);
        }
    }
    Ok(())
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .map(|e| IMG_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

// ── Transform ───────────────────────────────────────────────────────────────

/// Preprocessing for one split; output is normalised CHW `f32`.
#[derive(Debug, Clone)]
pub struct Transform {
    config: TransformConfig,
}

impl Transform {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Values per output image (`3 · size²`).
    pub fn output_len(&self) -> usize {
        let s = self.config.image_size as usize;
        3 * s * s
    }

    pub fn apply(&self, img: RgbImage, rng: &mut impl Rng) -> Vec<f32> {
        let size = self.config.image_size;
        let mut img = match self.config.random_resized_crop {
            Some(scale) => {
                let (x, y, w, h) = random_resized_crop_params(img.width(), img.height(), scale, rng);
                let crop = image::imageops::crop_imm(&img, x, y, w, h).to_image();
                image::imageops::resize(&crop, size, size, FilterType::CatmullRom)
            }
            None => resize_center_crop(&img, size, self.config.crop_pct),
        };
        if self.config.horizontal_flip && rng.random_bool(0.5) {
            image::imageops::flip_horizontal_in_place(&mut img);
        }
        to_chw_normalized(&img, self.config.mean, self.config.std)
    }
}

/// Crop box `(x, y, w, h)` for a random resized crop.
///
/// Up to ten draws of area fraction in `scale` and aspect ratio in
/// `[3/4, 4/3]` (log-uniform); falls back to a centre crop clamped to that
/// ratio range.
pub fn random_resized_crop_params(
    width: u32,
    height: u32,
    scale: [f32; 2],
    rng: &mut impl Rng,
) -> (u32, u32, u32, u32) {
    let (min_ratio, max_ratio) = (3.0f64 / 4.0, 4.0f64 / 3.0);
    let area = (width as f64) * (height as f64);
    let (log_min, log_max) = (min_ratio.ln(), max_ratio.ln());
    let (s_lo, s_hi) = (scale[0] as f64, scale[1].max(scale[0]) as f64);

    for _ in 0..10 {
        let target_area = area * rng.random_range(s_lo..=s_hi);
        let aspect = rng.random_range(log_min..=log_max).exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.random_range(0..=width - w);
            let y = rng.random_range(0..=height - h);
            return (x, y, w, h);
        }
    }

    let in_ratio = width as f64 / height as f64;
    let (w, h) = if in_ratio < min_ratio {
        (width, ((width as f64 / min_ratio).round() as u32).min(height))
    } else if in_ratio > max_ratio {
        (((height as f64 * max_ratio).round() as u32).min(width), height)
    } else {
        (width, height)
    };
    ((width - w) / 2, (height - h) / 2, w, h)
}

/// Resize the shorter side to `size / crop_pct`, then centre crop `size²`.
fn resize_center_crop(img: &RgbImage, size: u32, crop_pct: f32) -> RgbImage {
    let crop_pct = if crop_pct > 0.0 { crop_pct } else { 1.0 };
    let short = ((size as f32 / crop_pct).floor() as u32).max(size);
    let (w, h) = (img.width(), img.height());
    let (new_w, new_h) = if w <= h {
        (short, ((h as u64 * short as u64) / w.max(1) as u64) as u32)
    } else {
        (((w as u64 * short as u64) / h.max(1) as u64) as u32, short)
    };
    let resized = image::imageops::resize(img, new_w.max(size), new_h.max(size), FilterType::CatmullRom);
    let x = (resized.width() - size) / 2;
    let y = (resized.height() - size) / 2;
    image::imageops::crop_imm(&resized, x, y, size, size).to_image()
}

fn to_chw_normalized(img: &RgbImage, mean: [f32; 3], std: [f32; 3]) -> Vec<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let plane = w * h;
    let mut out = vec![0f32; 3 * plane];
    for (x, y, px) in img.enumerate_pixels() {
        let offset = y as usize * w + x as usize;
        for c in 0..3 {
            out[c * plane + offset] = (px.0[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }
    out
}

// ── DistributedSampler ──────────────────────────────────────────────────────

/// Splits an epoch's (optionally shuffled) index order across ranks.
///
/// Every rank sees `ceil(len / world_size)` indices; the order is padded by
/// wrapping around so shards are equal-sized and disjoint up to padding.
#[derive(Debug, Clone, Copy)]
pub struct DistributedSampler {
    pub dist: DistContext,
    pub shuffle: bool,
    pub seed: u64,
}

impl DistributedSampler {
    pub fn num_samples(&self, len: usize) -> usize {
        len.div_ceil(self.dist.world_size)
    }

    pub fn indices(&self, len: usize, epoch: usize) -> Vec<usize> {
        if len == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..len).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        let total = self.num_samples(len) * self.dist.world_size;
        let mut i = 0;
        while order.len() < total {
            order.push(order[i % len]);
            i += 1;
        }
        order
            .into_iter()
            .skip(self.dist.rank)
            .step_by(self.dist.world_size)
            .collect()
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// A decoded batch: images `(B, 3, H, W)` flattened row-major, plus labels.
#[derive(Debug, Clone)]
pub struct ImageBatch {
    pub images: Vec<f32>,
    pub labels: Vec<u32>,
    pub image_size: usize,
}

impl ImageBatch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Convert to Candle tensors `(images, labels)` on `device`.
    pub fn to_tensors(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let b = self.len();
        let s = self.image_size;
        let images = Tensor::from_slice(&self.images, (b, 3, s, s), device)?;
        let labels = Tensor::from_slice(&self.labels, b, device)?;
        Ok((images, labels))
    }
}

// ── ImageFolderLoader ───────────────────────────────────────────────────────

/// Batching knobs for [`ImageFolderLoader`].
#[derive(Debug, Clone, Copy)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub drop_last: bool,
    pub num_workers: usize,
    pub prefetch_batches: usize,
    pub seed: u64,
}

/// Iterable loader over an [`ImageFolder`] shard.
pub struct ImageFolderLoader {
    dataset: Arc<ImageFolder>,
    transform: Arc<Transform>,
    sampler: DistributedSampler,
    batch_size: usize,
    drop_last: bool,
    prefetch_batches: usize,
    seed: u64,
    pool: Arc<rayon::ThreadPool>,
}

impl ImageFolderLoader {
    pub fn new(
        dataset: Arc<ImageFolder>,
        transform: Transform,
        config: LoaderConfig,
        dist: DistContext,
    ) -> AnyhowResult<Self> {
        if config.batch_size == 0 {
            anyhow::bail!("batch_size must be > 0");
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_workers.max(1))
            .thread_name(|i| format!("mae-loader-{i}"))
            .build()
            .context("build loader thread pool")?;
        Ok(Self {
            dataset,
            transform: Arc::new(transform),
            sampler: DistributedSampler {
                dist,
                shuffle: config.shuffle,
                seed: config.seed,
            },
            batch_size: config.batch_size,
            drop_last: config.drop_last,
            prefetch_batches: config.prefetch_batches.max(1),
            seed: config.seed,
            pool: Arc::new(pool),
        })
    }

    pub fn dataset(&self) -> &ImageFolder {
        &self.dataset
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch on this rank.
    pub fn len(&self) -> usize {
        let n = self.sampler.num_samples(self.dataset.len());
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a producer for `epoch` and return the consuming end.
    pub fn iter(&self, epoch: usize) -> BatchIter {
        let mut indices = self.sampler.indices(self.dataset.len(), epoch);
        indices.truncate(self.len() * self.batch_size);

        let (tx, rx) = mpsc::sync_channel(self.prefetch_batches);
        let dataset = Arc::clone(&self.dataset);
        let transform = Arc::clone(&self.transform);
        let pool = Arc::clone(&self.pool);
        let batch_size = self.batch_size;
        let seed = self.seed;

        // Producer owns its inputs; a dropped receiver ends it at the next send.
        thread::spawn(move || {
            for chunk in indices.chunks(batch_size) {
                let batch = pool.install(|| load_batch(&dataset, &transform, chunk, seed, epoch));
                let failed = batch.is_err();
                if tx.send(batch).is_err() || failed {
                    return;
                }
            }
        });

        BatchIter { rx }
    }
}

/// Consuming end of a loader epoch.
pub struct BatchIter {
    rx: Receiver<AnyhowResult<ImageBatch>>,
}

impl Iterator for BatchIter {
    type Item = AnyhowResult<ImageBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

fn load_batch(
    dataset: &ImageFolder,
    transform: &Transform,
    indices: &[usize],
    seed: u64,
    epoch: usize,
) -> AnyhowResult<ImageBatch> {
    let decoded: Vec<(Vec<f32>, u32)> = indices
        .par_iter()
        .map(|&idx| -> AnyhowResult<(Vec<f32>, u32)> {
            let (path, label) = dataset.sample(idx);
            let img = image::open(path)
                .with_context(|| format!("decode {}", path.display()))?
                .to_rgb8();
            let mut rng = StdRng::seed_from_u64(sample_seed(seed, epoch, idx));
            Ok((transform.apply(img, &mut rng), *label))
        })
        .collect::<AnyhowResult<_>>()?;

    let mut images = Vec::with_capacity(decoded.len() * transform.output_len());
    let mut labels = Vec::with_capacity(decoded.len());
    for (pixels, label) in decoded {
        images.extend_from_slice(&pixels);
        labels.push(label);
    }
    Ok(ImageBatch {
        images,
        labels,
        image_size: transform.config().image_size as usize,
    })
}

/// Per-sample augmentation seed, independent of worker scheduling.
fn sample_seed(seed: u64, epoch: usize, index: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ ((epoch as u64) << 32)
        ^ index as u64
}

// ── Loader factory ──────────────────────────────────────────────────────────

/// Train and validation loaders for a pre-training run.
///
/// The train loader shuffles and drops the last partial batch. Unless
/// `VALIDATE_ON_VAL_SPLIT` is set, the validation loader reads the *train*
/// split (with `TRANSFORM_VAL`, no drop) and a warning is logged;
/// `<DATAPATH>/val` is then never opened.
pub fn pretrain_loaders(
    config: &PretrainConfig,
    dist: DistContext,
) -> AnyhowResult<(ImageFolderLoader, ImageFolderLoader)> {
    if config.verbose && dist.is_main() {
        tracing::info!(datapath = %config.datapath.display(), "Loading image folders");
    }
    let train_set = Arc::new(ImageFolder::open(&config.datapath.join("train"))?);
    let val_set = if config.validate_on_val_split {
        Arc::new(ImageFolder::open(&config.datapath.join("val"))?)
    } else {
        if dist.is_main() {
            tracing::warn!(
                "Validation loader is built from the train split; \
                 set VALIDATE_ON_VAL_SPLIT to use <DATAPATH>/val"
            );
        }
        Arc::clone(&train_set)
    };
    if config.verbose && dist.is_main() {
        tracing::info!(train = %train_set, val = %val_set, "Datasets");
    }

    let base = LoaderConfig {
        batch_size: config.batch_size,
        shuffle: true,
        drop_last: true,
        num_workers: config.num_workers,
        prefetch_batches: config.prefetch_batches,
        seed: config.seed,
    };
    let train = ImageFolderLoader::new(
        train_set,
        Transform::new(config.transform_train.clone()),
        base,
        dist,
    )?;
    let val = ImageFolderLoader::new(
        val_set,
        Transform::new(config.transform_val.clone()),
        LoaderConfig {
            drop_last: false,
            ..base
        },
        dist,
    )?;
    Ok((train, val))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn write_folder(root: &Path, classes: &[(&str, usize)], side: u32) {
        for (class, count) in classes {
            let dir = root.join(class);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..*count {
                let img = RgbImage::from_pixel(side + i as u32, side, Rgb([i as u8 * 20, 100, 200]));
                img.save(dir.join(format!("img_{i}.png"))).unwrap();
            }
        }
        std::fs::write(root.join(classes[0].0).join("notes.txt"), "ignored").unwrap();
    }

    fn loader_config(batch_size: usize, drop_last: bool) -> LoaderConfig {
        LoaderConfig {
            batch_size,
            shuffle: true,
            drop_last,
            num_workers: 2,
            prefetch_batches: 2,
            seed: 7,
        }
    }

    #[test]
    fn image_folder_indexes_sorted_classes() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), &[("dog", 2), ("cat", 3)], 12);
        let ds = ImageFolder::open(dir.path()).unwrap();
        assert_eq!(ds.classes(), &["cat".to_string(), "dog".to_string()]);
        assert_eq!(ds.len(), 5);
        assert_eq!(ds.sample(0).1, 0);
        assert_eq!(ds.sample(4).1, 1);
    }

    #[test]
    fn empty_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty_class")).unwrap();
        assert!(ImageFolder::open(dir.path()).is_err());
    }

    #[test]
    fn random_resized_crop_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..200 {
            let (x, y, w, h) = random_resized_crop_params(40, 25, [0.2, 1.0], &mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= 40 && y + h <= 25);
        }
    }

    #[test]
    fn transform_output_is_chw_normalised() {
        let t = Transform::new(TransformConfig::val(8));
        let img = RgbImage::from_pixel(20, 10, Rgb([255, 0, 128]));
        let mut rng = StdRng::seed_from_u64(0);
        let out = t.apply(img, &mut rng);
        assert_eq!(out.len(), 3 * 8 * 8);
        let expected_r = (1.0 - 0.485) / 0.229;
        assert!((out[0] - expected_r).abs() < 1e-4);
        let expected_g = (0.0 - 0.456) / 0.224;
        assert!((out[64] - expected_g).abs() < 1e-4);
    }

    #[test]
    fn sampler_shards_are_disjoint_and_cover() {
        let len = 10;
        let mut seen = Vec::new();
        for rank in 0..3 {
            let s = DistributedSampler {
                dist: DistContext::new(rank, 3, rank).unwrap(),
                shuffle: true,
                seed: 1,
            };
            let idx = s.indices(len, 4);
            assert_eq!(idx.len(), 4);
            seen.extend(idx);
        }
        assert_eq!(seen.len(), 12);
        let mut unique = seen.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique, (0..len).collect::<Vec<_>>());
    }

    #[test]
    fn sampler_shuffle_depends_on_epoch() {
        let s = DistributedSampler {
            dist: DistContext::single(),
            shuffle: true,
            seed: 3,
        };
        assert_eq!(s.indices(64, 0), s.indices(64, 0));
        assert_ne!(s.indices(64, 0), s.indices(64, 1));
    }

    #[test]
    fn loader_yields_len_batches() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), &[("a", 3), ("b", 4)], 10);
        let ds = Arc::new(ImageFolder::open(dir.path()).unwrap());

        let keep = ImageFolderLoader::new(
            Arc::clone(&ds),
            Transform::new(TransformConfig::train(8)),
            loader_config(3, false),
            DistContext::single(),
        )
        .unwrap();
        assert_eq!(keep.len(), 3);
        let sizes: Vec<usize> = keep.iter(0).map(|b| b.unwrap().len()).collect();
        assert_eq!(sizes, vec![3, 3, 1]);

        let drop = ImageFolderLoader::new(
            ds,
            Transform::new(TransformConfig::train(8)),
            loader_config(3, true),
            DistContext::single(),
        )
        .unwrap();
        assert_eq!(drop.len(), 2);
        let batch = drop.iter(1).next().unwrap().unwrap();
        assert_eq!(batch.images.len(), 3 * 3 * 8 * 8);
        let (images, labels) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(images.dims(), &[3, 3, 8, 8]);
        assert_eq!(labels.dims(), &[3]);
    }

    #[test]
    fn validation_loader_split_follows_flag() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(&dir.path().join("train"), &[("a", 4)], 10);
        write_folder(&dir.path().join("val"), &[("a", 1), ("b", 1)], 10);
        let mut config = PretrainConfig::with_datapath(dir.path());
        config.batch_size = 2;
        config.transform_train = TransformConfig::train(8);
        config.transform_val = TransformConfig::val(8);

        let (train, val) = pretrain_loaders(&config, DistContext::single()).unwrap();
        assert_eq!(train.len(), 2);
        assert_eq!(val.dataset().len(), 4);

        config.validate_on_val_split = true;
        let (_, val) = pretrain_loaders(&config, DistContext::single()).unwrap();
        assert_eq!(val.dataset().len(), 2);
        assert_eq!(val.dataset().classes().len(), 2);
    }

    #[test]
    fn val_folder_only_required_when_flag_set() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(&dir.path().join("train"), &[("a", 2)], 10);
        let mut config = PretrainConfig::with_datapath(dir.path());
        config.batch_size = 2;
        config.transform_train = TransformConfig::train(8);
        config.transform_val = TransformConfig::val(8);

        assert!(pretrain_loaders(&config, DistContext::single()).is_ok());
        config.validate_on_val_split = true;
        assert!(pretrain_loaders(&config, DistContext::single()).is_err());
    }
}

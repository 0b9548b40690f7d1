//! Feature/label alignment across a batch of images.
//!
//! Drives extraction and quantization for every usable image in a batch,
//! producing a flat table of (embedding, soft-label) pairs in image-arrival
//! order, then filters out ambiguous patches. Images the batch policy
//! excludes (non-RGBA uploads, undecodable bytes, degenerate geometry) are
//! recorded as skips and never abort the run; contract breaches at the
//! extractor boundary do.

use candle_core::{Device, Tensor};
use image::{GrayImage, RgbImage};
use patchseg_core::{ImageBlob, PatchSegError, Result};
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::extractor::FeatureExtractor;
use crate::geometry::{self, PatchGrid};
use crate::quantize;

// ---------------------------------------------------------------------------
// Skip accounting
// ---------------------------------------------------------------------------

/// Why an image was excluded from the training batch.
///
/// Skips are values, not errors: a batch may contain images that must be
/// excluded from training data without aborting the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The bytes did not decode as an image.
    Undecodable,
    /// The image has no alpha channel, so it carries no mask.
    MissingAlpha,
    /// Zero-size image or an aspect ratio with no full patch column.
    DegenerateGeometry,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undecodable => write!(f, "undecodable"),
            Self::MissingAlpha => write!(f, "missing alpha channel"),
            Self::DegenerateGeometry => write!(f, "degenerate geometry"),
        }
    }
}

/// One skipped image, with enough context for the run report.
#[derive(Debug, Clone)]
pub struct ImageSkip {
    /// Position of the image in the input batch.
    pub index: usize,
    /// File name from the blob.
    pub file_name: String,
    /// Why it was excluded.
    pub reason: SkipReason,
}

// ---------------------------------------------------------------------------
// Aligned tables
// ---------------------------------------------------------------------------

/// Flat (embedding, soft-label) tables over all accepted patches.
///
/// `embeddings` is row-major `[patch_count, feature_dim]`, concatenated
/// across images in arrival order; `labels` is the parallel per-patch
/// column. The two stay index-aligned by construction.
#[derive(Debug, Clone)]
pub struct AlignedBatch {
    /// Row-major patch embeddings.
    pub embeddings: Vec<f32>,
    /// Per-patch soft labels in [0, 1], same ordering as `embeddings`.
    pub labels: Vec<f32>,
    /// Embedding dimension reported by the extractor.
    pub feature_dim: usize,
    /// Images that contributed patches.
    pub images_accepted: usize,
    /// Images excluded by batch policy.
    pub skips: Vec<ImageSkip>,
}

impl AlignedBatch {
    /// Total number of aligned patches.
    pub fn patch_count(&self) -> usize {
        self.labels.len()
    }
}

/// The unambiguous subset of an [`AlignedBatch`], ready for fitting.
#[derive(Debug, Clone)]
pub struct CleanSubset {
    /// Row-major features of the retained patches.
    pub features: Vec<f32>,
    /// Soft labels of the retained patches (all near 0 or near 1).
    pub labels: Vec<f32>,
    /// Embedding dimension.
    pub feature_dim: usize,
}

impl CleanSubset {
    /// Number of retained patches.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the subset is empty.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Alignment
// ---------------------------------------------------------------------------

/// Align embeddings and soft labels for every usable image in the batch.
///
/// Images are processed strictly sequentially; the tables require stable
/// row-major ordering for the index-aligned filter step.
///
/// # Errors
///
/// Returns [`PatchSegError::InsufficientTrainingData`] when no image in the
/// batch is usable, and [`PatchSegError::Extractor`] when the feature
/// extractor breaks its shape contract.
pub fn align_batch(
    blobs: &[ImageBlob],
    extractor: &dyn FeatureExtractor,
    config: &PipelineConfig,
) -> Result<AlignedBatch> {
    let mut embeddings: Vec<f32> = Vec::new();
    let mut labels: Vec<f32> = Vec::new();
    let mut feature_dim: Option<usize> = None;
    let mut images_accepted = 0usize;
    let mut skips: Vec<ImageSkip> = Vec::new();

    let skip = |skips: &mut Vec<ImageSkip>, index: usize, blob: &ImageBlob, reason: SkipReason| {
        warn!(image = %blob.file_name, %reason, "skipping image");
        skips.push(ImageSkip {
            index,
            file_name: blob.file_name.clone(),
            reason,
        });
    };

    for (index, blob) in blobs.iter().enumerate() {
        let decoded = match image::load_from_memory(&blob.bytes) {
            Ok(img) => img,
            Err(_) => {
                skip(&mut skips, index, blob, SkipReason::Undecodable);
                continue;
            }
        };

        if !decoded.color().has_alpha() {
            skip(&mut skips, index, blob, SkipReason::MissingAlpha);
            continue;
        }

        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        let grid = match PatchGrid::for_image(width, height, config) {
            Ok(grid) => grid,
            Err(PatchSegError::InvalidImageGeometry(_)) => {
                skip(&mut skips, index, blob, SkipReason::DegenerateGeometry);
                continue;
            }
            Err(e) => return Err(e),
        };

        let (rgb, mask) = split_rgba(&rgba);
        let resized_rgb = geometry::resize_rgb(&rgb, &grid);
        let resized_mask = geometry::resize_mask(&mask, &grid);

        let image_labels = quantize::soft_labels(&resized_mask, &grid)?;
        let pixels = normalize_rgb(&resized_rgb, config)?;
        let embedded = extractor.embed(&pixels)?;

        let (batch, patches, dim) = embedded
            .dims3()
            .map_err(|e| PatchSegError::Extractor(format!("embedding shape: {e}")))?;
        if batch != 1 || patches != grid.patch_count() {
            return Err(PatchSegError::Extractor(format!(
                "expected [1, {}, D] embeddings for a {}x{} grid, got [{batch}, {patches}, {dim}]",
                grid.patch_count(),
                grid.rows,
                grid.cols
            )));
        }
        match feature_dim {
            None => feature_dim = Some(dim),
            Some(expected) if expected != dim => {
                return Err(PatchSegError::Extractor(format!(
                    "embedding dim changed mid-batch: expected {expected}, got {dim}"
                )));
            }
            Some(_) => {}
        }

        let image_embeddings: Vec<f32> = embedded
            .flatten_all()
            .and_then(|t| t.to_vec1())
            .map_err(|e| PatchSegError::Extractor(format!("embedding readout: {e}")))?;

        embeddings.extend_from_slice(&image_embeddings);
        labels.extend_from_slice(&image_labels);
        images_accepted += 1;

        debug!(
            image = %blob.file_name,
            rows = grid.rows,
            cols = grid.cols,
            patches_total = labels.len(),
            "aligned image"
        );
        debug_assert_eq!(embeddings.len(), labels.len() * dim);
    }

    let feature_dim = match feature_dim {
        Some(dim) => dim,
        None => {
            return Err(PatchSegError::InsufficientTrainingData(format!(
                "no usable RGBA images in batch of {}",
                blobs.len()
            )));
        }
    };

    Ok(AlignedBatch {
        embeddings,
        labels,
        feature_dim,
        images_accepted,
        skips,
    })
}

/// Split an RGBA raster into its RGB plane and alpha-derived mask.
fn split_rgba(rgba: &image::RgbaImage) -> (RgbImage, GrayImage) {
    let (width, height) = rgba.dimensions();
    let pixels = width as usize * height as usize;
    let mut rgb = Vec::with_capacity(pixels * 3);
    let mut alpha = Vec::with_capacity(pixels);

    for px in rgba.as_raw().chunks_exact(4) {
        rgb.extend_from_slice(&px[..3]);
        alpha.push(px[3]);
    }

    // from_raw only fails on length mismatch, which cannot happen here.
    let rgb = RgbImage::from_raw(width, height, rgb).expect("rgb plane length");
    let mask = GrayImage::from_raw(width, height, alpha).expect("alpha plane length");
    (rgb, mask)
}

/// Normalize an RGB plane into a `[1, 3, H, W]` channel-first tensor.
///
/// Pixels scale to [0, 1], then shift/scale by the per-channel constants in
/// the config.
pub fn normalize_rgb(image: &RgbImage, config: &PipelineConfig) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let plane = width as usize * height as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (i, px) in image.as_raw().chunks_exact(3).enumerate() {
        for c in 0..3 {
            data[c * plane + i] =
                (f32::from(px[c]) / 255.0 - config.channel_mean[c]) / config.channel_std[c];
        }
    }

    Tensor::from_vec(data, (1, 3, height as usize, width as usize), &Device::Cpu)
        .map_err(|e| PatchSegError::Extractor(format!("pixel tensor: {e}")))
}

// ---------------------------------------------------------------------------
// Clean-subset filter
// ---------------------------------------------------------------------------

/// Filter an aligned batch down to its unambiguous patches.
///
/// A patch is retained when its soft label is strictly below `clean_low` or
/// strictly above `clean_high`; the boundary values themselves are ambiguous
/// and dropped.
///
/// # Errors
///
/// Returns [`PatchSegError::InsufficientTrainingData`] when nothing
/// survives the filter.
pub fn clean_subset(batch: &AlignedBatch, config: &PipelineConfig) -> Result<CleanSubset> {
    let dim = batch.feature_dim;
    let mut features: Vec<f32> = Vec::new();
    let mut labels: Vec<f32> = Vec::new();

    for (i, &label) in batch.labels.iter().enumerate() {
        if label < config.clean_low || label > config.clean_high {
            features.extend_from_slice(&batch.embeddings[i * dim..(i + 1) * dim]);
            labels.push(label);
        }
    }

    if labels.is_empty() {
        return Err(PatchSegError::InsufficientTrainingData(format!(
            "clean subset is empty: all {} patch labels fall in [{}, {}]",
            batch.labels.len(),
            config.clean_low,
            config.clean_high
        )));
    }

    debug!(
        patches_total = batch.labels.len(),
        patches_clean = labels.len(),
        "filtered ambiguous patches"
    );

    Ok(CleanSubset {
        features,
        labels,
        feature_dim: dim,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::MeanColorExtractor;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            patch_size: 8,
            grid_size: 64,
            ..PipelineConfig::default()
        }
    }

    fn png_blob(name: &str, img: DynamicImage) -> ImageBlob {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        ImageBlob {
            file_name: name.to_string(),
            bytes: buf.into_inner(),
        }
    }

    /// 64x64 RGBA image: left half white foreground (alpha 255), right half
    /// black background (alpha 0). Patch-aligned, so soft labels are exact.
    fn half_foreground() -> DynamicImage {
        let img = RgbaImage::from_fn(64, 64, |x, _| {
            if x < 32 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 0])
            }
        });
        DynamicImage::ImageRgba8(img)
    }

    fn uniform_alpha(alpha: u8) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 64, Rgba([120, 90, 60, alpha])))
    }

    #[test]
    fn test_tables_stay_aligned() {
        let extractor = MeanColorExtractor::new(8, 4);
        let blobs = vec![
            png_blob("a.png", half_foreground()),
            png_blob("b.png", half_foreground()),
        ];

        let batch = align_batch(&blobs, &extractor, &test_config()).unwrap();
        assert_eq!(batch.images_accepted, 2);
        assert_eq!(batch.patch_count(), 2 * 8 * 8);
        assert_eq!(batch.embeddings.len(), batch.patch_count() * batch.feature_dim);
        assert!(batch.skips.is_empty());
    }

    #[test]
    fn test_half_foreground_labels_are_exact() {
        let extractor = MeanColorExtractor::new(8, 4);
        let blobs = vec![png_blob("a.png", half_foreground())];

        let batch = align_batch(&blobs, &extractor, &test_config()).unwrap();
        // 8x8 grid; columns 0..4 foreground, 4..8 background.
        for r in 0..8 {
            for c in 0..8 {
                let label = batch.labels[r * 8 + c];
                let expected = if c < 4 { 1.0 } else { 0.0 };
                assert_eq!(label, expected, "patch ({r},{c})");
            }
        }
    }

    #[test]
    fn test_non_rgba_image_is_skipped_not_fatal() {
        let extractor = MeanColorExtractor::new(8, 4);
        let rgb_only = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            64,
            64,
            image::Rgb([10, 20, 30]),
        ));
        let blobs = vec![
            png_blob("good1.png", half_foreground()),
            png_blob("flat.png", rgb_only),
            png_blob("good2.png", half_foreground()),
        ];

        let batch = align_batch(&blobs, &extractor, &test_config()).unwrap();
        assert_eq!(batch.images_accepted, 2);
        assert_eq!(batch.skips.len(), 1);
        assert_eq!(batch.skips[0].index, 1);
        assert_eq!(batch.skips[0].reason, SkipReason::MissingAlpha);
    }

    #[test]
    fn test_undecodable_bytes_are_skipped() {
        let extractor = MeanColorExtractor::new(8, 4);
        let blobs = vec![
            ImageBlob {
                file_name: "garbage.bin".to_string(),
                bytes: vec![0xde, 0xad, 0xbe, 0xef],
            },
            png_blob("good.png", half_foreground()),
        ];

        let batch = align_batch(&blobs, &extractor, &test_config()).unwrap();
        assert_eq!(batch.images_accepted, 1);
        assert_eq!(batch.skips[0].reason, SkipReason::Undecodable);
    }

    #[test]
    fn test_empty_batch_is_insufficient() {
        let extractor = MeanColorExtractor::new(8, 4);
        let err = align_batch(&[], &extractor, &test_config()).unwrap_err();
        assert!(matches!(err, PatchSegError::InsufficientTrainingData(_)));
    }

    #[test]
    fn test_all_skipped_batch_is_insufficient() {
        let extractor = MeanColorExtractor::new(8, 4);
        let rgb_only =
            DynamicImage::ImageRgb8(image::RgbImage::from_pixel(64, 64, image::Rgb([1, 2, 3])));
        let err = align_batch(&[png_blob("flat.png", rgb_only)], &extractor, &test_config())
            .unwrap_err();
        assert!(matches!(err, PatchSegError::InsufficientTrainingData(_)));
    }

    #[test]
    fn test_ambiguous_masks_empty_clean_subset() {
        let extractor = MeanColorExtractor::new(8, 4);
        // Alpha 128 -> soft labels ~0.502 everywhere.
        let blobs = vec![png_blob("gray.png", uniform_alpha(128))];

        let batch = align_batch(&blobs, &extractor, &test_config()).unwrap();
        let err = clean_subset(&batch, &test_config()).unwrap_err();
        assert!(matches!(err, PatchSegError::InsufficientTrainingData(_)));
    }

    #[test]
    fn test_clean_filter_boundary_is_strict() {
        let batch = AlignedBatch {
            embeddings: vec![0.0, 1.0, 2.0, 3.0, 4.0],
            labels: vec![0.01, 0.99, 0.0099, 0.991, 0.5],
            feature_dim: 1,
            images_accepted: 1,
            skips: Vec::new(),
        };

        let clean = clean_subset(&batch, &PipelineConfig::default()).unwrap();
        // 0.01 and 0.99 sit on the boundary and are excluded; 0.0099 and
        // 0.991 survive.
        assert_eq!(clean.labels, vec![0.0099, 0.991]);
        assert_eq!(clean.features, vec![2.0, 3.0]);
    }

    #[test]
    fn test_normalize_rgb_channel_first() {
        let config = PipelineConfig::default();
        let img = RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 127]));
        let tensor = normalize_rgb(&img, &config).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 2]);

        let values: Vec<f32> = tensor.flatten_all().unwrap().to_vec1().unwrap();
        let red = (1.0 - config.channel_mean[0]) / config.channel_std[0];
        let green = (0.0 - config.channel_mean[1]) / config.channel_std[1];
        let blue = (127.0 / 255.0 - config.channel_mean[2]) / config.channel_std[2];
        for i in 0..4 {
            assert!((values[i] - red).abs() < 1e-6);
            assert!((values[4 + i] - green).abs() < 1e-6);
            assert!((values[8 + i] - blue).abs() < 1e-6);
        }
    }
}

//! Mask quantization into per-patch soft labels.
//!
//! A soft label is the fraction of foreground pixels inside one patch: the
//! arithmetic mean of the mask over a `P × P` block. Realized as
//! non-overlapping average pooling with kernel = stride = P, which is the
//! same box filter the label definition describes.

use candle_core::{Device, Tensor};
use image::GrayImage;
use patchseg_core::{PatchSegError, Result};

use crate::geometry::PatchGrid;

/// Convert an 8-bit mask plane to a `[1, 1, H, W]` float tensor in [0, 1].
pub fn mask_tensor(mask: &GrayImage) -> Result<Tensor> {
    let (width, height) = mask.dimensions();
    let data: Vec<f32> = mask.as_raw().iter().map(|&v| f32::from(v) / 255.0).collect();
    Tensor::from_vec(data, (1, 1, height as usize, width as usize), &Device::Cpu)
        .map_err(|e| PatchSegError::InvalidImageGeometry(format!("mask tensor: {e}")))
}

/// Quantize a resized mask tensor into one soft label per patch.
///
/// Input shape `[1, 1, rows·P, cols·P]`; output is `rows · cols` scalars in
/// [0, 1], row-major over the patch grid.
///
/// # Errors
///
/// Returns [`PatchSegError::InvalidImageGeometry`] when the mask dimensions
/// are not exact multiples of the patch stride. Masks resized through
/// [`crate::geometry::resize_mask`] always are.
pub fn quantize(mask: &Tensor, patch: usize) -> Result<Vec<f32>> {
    let (_, _, height, width) = mask
        .dims4()
        .map_err(|e| PatchSegError::InvalidImageGeometry(format!("mask shape: {e}")))?;
    if patch == 0 || height % patch != 0 || width % patch != 0 {
        return Err(PatchSegError::InvalidImageGeometry(format!(
            "mask {height}x{width} is not a whole number of {patch}px patches"
        )));
    }

    let pooled = mask
        .avg_pool2d(patch)
        .map_err(|e| PatchSegError::InvalidImageGeometry(format!("mask pooling: {e}")))?;
    pooled
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| PatchSegError::InvalidImageGeometry(format!("label readout: {e}")))
}

/// Soft labels for a resized mask plane on the given grid.
pub fn soft_labels(mask: &GrayImage, grid: &PatchGrid) -> Result<Vec<f32>> {
    let labels = quantize(&mask_tensor(mask)?, grid.patch)?;
    debug_assert_eq!(labels.len(), grid.patch_count());
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn tensor_from(values: Vec<f32>, h: usize, w: usize) -> Tensor {
        Tensor::from_vec(values, (1, 1, h, w), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_output_length_is_patch_count() {
        let mask = tensor_from(vec![0.5; 64 * 32], 64, 32);
        let labels = quantize(&mask, 16).unwrap();
        assert_eq!(labels.len(), 4 * 2);
    }

    #[test]
    fn test_uniform_patches_are_exact() {
        for patch in [2, 4, 16] {
            let h = patch * 3;
            let w = patch * 2;
            let ones = tensor_from(vec![1.0; h * w], h, w);
            let zeros = tensor_from(vec![0.0; h * w], h, w);

            for label in quantize(&ones, patch).unwrap() {
                assert_eq!(label, 1.0);
            }
            for label in quantize(&zeros, patch).unwrap() {
                assert_eq!(label, 0.0);
            }
        }
    }

    #[test]
    fn test_matches_arithmetic_mean() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let (h, w, patch) = (32, 48, 8);
        let values: Vec<f32> = (0..h * w).map(|_| rng.gen::<f32>()).collect();
        let mask = tensor_from(values.clone(), h, w);

        let labels = quantize(&mask, patch).unwrap();
        let (rows, cols) = (h / patch, w / patch);
        assert_eq!(labels.len(), rows * cols);

        for r in 0..rows {
            for c in 0..cols {
                let mut sum = 0.0f64;
                for py in 0..patch {
                    for px in 0..patch {
                        sum += f64::from(values[(r * patch + py) * w + (c * patch + px)]);
                    }
                }
                let mean = sum / (patch * patch) as f64;
                let got = f64::from(labels[r * cols + c]);
                assert!(
                    (got - mean).abs() <= 1e-5,
                    "patch ({r},{c}): got {got}, want {mean}"
                );
            }
        }
    }

    #[test]
    fn test_row_major_ordering() {
        // Light up exactly one patch: row 1, col 2 on a 2x4 grid of 4px patches.
        let (h, w, patch) = (8, 16, 4);
        let mut values = vec![0.0f32; h * w];
        for py in 0..patch {
            for px in 0..patch {
                values[(patch + py) * w + (2 * patch + px)] = 1.0;
            }
        }
        let labels = quantize(&tensor_from(values, h, w), patch).unwrap();

        let cols = w / patch;
        for (i, &label) in labels.iter().enumerate() {
            let expected = if i == cols + 2 { 1.0 } else { 0.0 };
            assert_eq!(label, expected, "index {i}");
        }
    }

    #[test]
    fn test_labels_stay_in_unit_interval() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let values: Vec<f32> = (0..64 * 64).map(|_| rng.gen::<f32>()).collect();
        let labels = quantize(&tensor_from(values, 64, 64), 16).unwrap();
        for label in labels {
            assert!((0.0..=1.0).contains(&label));
        }
    }

    #[test]
    fn test_non_multiple_dims_rejected() {
        let mask = tensor_from(vec![0.0; 30 * 32], 30, 32);
        let err = quantize(&mask, 16).unwrap_err();
        assert!(matches!(err, PatchSegError::InvalidImageGeometry(_)));
    }

    #[test]
    fn test_gray_image_path() {
        let mut mask = GrayImage::new(32, 32);
        for pixel in mask.pixels_mut() {
            pixel.0 = [255];
        }
        let grid = PatchGrid {
            rows: 2,
            cols: 2,
            patch: 16,
        };
        let labels = soft_labels(&mask, &grid).unwrap();
        assert_eq!(labels, vec![1.0; 4]);
    }
}

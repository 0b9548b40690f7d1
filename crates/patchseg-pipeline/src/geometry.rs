//! Patch-grid geometry.
//!
//! Maps an image's original dimensions onto a grid of fixed-stride patches
//! and resizes the image and mask planes to exactly fill that grid. One
//! [`PatchGrid`] value drives both resizes, so the two planes cannot end up
//! on desynchronized grids.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use patchseg_core::{PatchSegError, Result};

use crate::config::PipelineConfig;

/// Patch-grid dimensions derived from an image's aspect ratio.
///
/// Rows come from the target grid size alone; columns scale with the aspect
/// ratio. Both are computed with truncating integer arithmetic, so the same
/// input dimensions always map to the same grid with no floating-point
/// boundary cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchGrid {
    /// Patch rows in the resized image.
    pub rows: usize,
    /// Patch columns in the resized image.
    pub cols: usize,
    /// Patch stride in pixels.
    pub patch: usize,
}

impl PatchGrid {
    /// Compute the grid for an image of `width × height` pixels.
    ///
    /// # Errors
    ///
    /// Returns [`PatchSegError::InvalidImageGeometry`] for zero-size images
    /// and for aspect ratios so extreme that no full patch column fits.
    pub fn for_image(width: u32, height: u32, config: &PipelineConfig) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(PatchSegError::InvalidImageGeometry(format!(
                "zero-size image: {width}x{height}"
            )));
        }

        let patch = config.patch_size as u64;
        let rows = config.grid_size as u64 / patch;
        let cols = (u64::from(width) * config.grid_size as u64) / (u64::from(height) * patch);

        if rows == 0 || cols == 0 {
            return Err(PatchSegError::InvalidImageGeometry(format!(
                "degenerate patch grid {rows}x{cols} for {width}x{height} image"
            )));
        }

        Ok(Self {
            rows: rows as usize,
            cols: cols as usize,
            patch: config.patch_size,
        })
    }

    /// Resized pixel width (`cols · patch`).
    pub fn pixel_width(&self) -> u32 {
        (self.cols * self.patch) as u32
    }

    /// Resized pixel height (`rows · patch`).
    pub fn pixel_height(&self) -> u32 {
        (self.rows * self.patch) as u32
    }

    /// Number of patches in the grid (`rows · cols`).
    pub fn patch_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Resize an RGB plane to exactly fill the grid, with Catmull-Rom sampling.
pub fn resize_rgb(image: &RgbImage, grid: &PatchGrid) -> RgbImage {
    imageops::resize(
        image,
        grid.pixel_width(),
        grid.pixel_height(),
        FilterType::CatmullRom,
    )
}

/// Resize a mask plane to exactly fill the grid.
///
/// The mask uses bilinear sampling; soft labels are averages over patches,
/// so the cheaper filter loses nothing. The target dimensions are identical
/// to the image plane's by construction.
pub fn resize_mask(mask: &GrayImage, grid: &PatchGrid) -> GrayImage {
    imageops::resize(
        mask,
        grid.pixel_width(),
        grid.pixel_height(),
        FilterType::Triangle,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::default()
    }

    #[test]
    fn test_square_image_square_grid() {
        // 256x256 at grid 768, patch 16 -> 48x48 = 2304 patches.
        let grid = PatchGrid::for_image(256, 256, &config()).unwrap();
        assert_eq!(grid.rows, 48);
        assert_eq!(grid.cols, 48);
        assert_eq!(grid.patch_count(), 2304);
        assert_eq!(grid.pixel_width(), 768);
        assert_eq!(grid.pixel_height(), 768);
    }

    #[test]
    fn test_wide_image_scales_columns() {
        let grid = PatchGrid::for_image(512, 256, &config()).unwrap();
        assert_eq!(grid.rows, 48);
        assert_eq!(grid.cols, 96);
    }

    #[test]
    fn test_resized_dims_are_patch_multiples() {
        for (w, h) in [(37, 411), (640, 480), (1023, 767), (3, 999), (800, 100)] {
            let grid = match PatchGrid::for_image(w, h, &config()) {
                Ok(g) => g,
                Err(PatchSegError::InvalidImageGeometry(_)) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            };
            assert_eq!(grid.pixel_width() % 16, 0);
            assert_eq!(grid.pixel_height() % 16, 0);
        }
    }

    #[test]
    fn test_aspect_preserved_within_one_patch() {
        for (w, h) in [(37, 411), (640, 480), (1920, 1080), (333, 777)] {
            let grid = PatchGrid::for_image(w, h, &config()).unwrap();
            let exact_cols = f64::from(w) * 768.0 / (f64::from(h) * 16.0);
            assert!(
                (grid.cols as f64 - exact_cols).abs() < 1.0,
                "{w}x{h}: cols={} exact={exact_cols}",
                grid.cols
            );
        }
    }

    #[test]
    fn test_zero_size_image_rejected() {
        for (w, h) in [(0, 100), (100, 0), (0, 0)] {
            let err = PatchGrid::for_image(w, h, &config()).unwrap_err();
            assert!(matches!(err, PatchSegError::InvalidImageGeometry(_)));
        }
    }

    #[test]
    fn test_extreme_aspect_rejected() {
        // 1 pixel wide, 1000 tall: cols truncates to zero.
        let err = PatchGrid::for_image(1, 1000, &config()).unwrap_err();
        assert!(matches!(err, PatchSegError::InvalidImageGeometry(_)));
    }

    #[test]
    fn test_image_and_mask_resize_to_identical_dims() {
        let grid = PatchGrid::for_image(100, 80, &config()).unwrap();
        let rgb = RgbImage::new(100, 80);
        let mask = GrayImage::new(100, 80);

        let rgb_resized = resize_rgb(&rgb, &grid);
        let mask_resized = resize_mask(&mask, &grid);

        assert_eq!(rgb_resized.dimensions(), mask_resized.dimensions());
        assert_eq!(rgb_resized.width(), grid.pixel_width());
        assert_eq!(rgb_resized.height(), grid.pixel_height());
    }

    #[test]
    fn test_smaller_grid_config() {
        let cfg = PipelineConfig {
            grid_size: 224,
            ..PipelineConfig::default()
        };
        let grid = PatchGrid::for_image(640, 480, &cfg).unwrap();
        // rows = 224 / 16 = 14, cols = 640 * 224 / (480 * 16) = 18 (truncated from 18.66).
        assert_eq!(grid.rows, 14);
        assert_eq!(grid.cols, 18);
    }
}

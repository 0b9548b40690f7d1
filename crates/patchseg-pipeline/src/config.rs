//! Immutable configuration for one training run.
//!
//! Every component takes the configuration by reference; there is no ambient
//! state, so two runs with equal configs and equal inputs produce identical
//! artifacts.

use patchseg_core::{PatchSegError, Result};
use serde::{Deserialize, Serialize};

/// Per-channel normalization constants of the ImageNet training corpus.
///
/// These match the statistics the usual frozen backbones (DINO family
/// included) were trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Configuration for the patch pipeline.
///
/// # Example
///
/// ```
/// use patchseg_pipeline::PipelineConfig;
///
/// let config = PipelineConfig {
///     grid_size: 384,
///     ..PipelineConfig::default()
/// };
/// assert_eq!(config.patch_size, 16);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Patch stride in pixels; every patch is `patch_size × patch_size`.
    pub patch_size: usize,
    /// Target grid long-edge size in pixels; the resized height is the
    /// largest multiple of `patch_size` not exceeding this.
    pub grid_size: usize,
    /// Per-channel mean subtracted after scaling pixels to [0, 1].
    pub channel_mean: [f32; 3],
    /// Per-channel standard deviation dividing the centered pixels.
    pub channel_std: [f32; 3],
    /// Soft labels strictly below this are background training patches.
    pub clean_low: f32,
    /// Soft labels strictly above this are foreground training patches.
    pub clean_high: f32,
    /// Classifier training constants.
    pub trainer: TrainerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            patch_size: 16,
            grid_size: 768,
            channel_mean: IMAGENET_MEAN,
            channel_std: IMAGENET_STD,
            clean_low: 0.01,
            clean_high: 0.99,
            trainer: TrainerConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration before a run.
    ///
    /// # Errors
    ///
    /// Returns [`PatchSegError::Config`] on zero strides, a grid smaller
    /// than one patch, zero standard deviations, or inverted clean
    /// thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 {
            return Err(PatchSegError::Config("patch_size must be > 0".to_string()));
        }
        if self.grid_size < self.patch_size {
            return Err(PatchSegError::Config(format!(
                "grid_size {} smaller than patch_size {}",
                self.grid_size, self.patch_size
            )));
        }
        if self.channel_std.iter().any(|&s| s <= 0.0) {
            return Err(PatchSegError::Config(
                "channel_std entries must be > 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.clean_low)
            || !(0.0..=1.0).contains(&self.clean_high)
            || self.clean_low >= self.clean_high
        {
            return Err(PatchSegError::Config(format!(
                "clean thresholds must satisfy 0 <= low < high <= 1, got ({}, {})",
                self.clean_low, self.clean_high
            )));
        }
        self.trainer.validate()
    }
}

/// Constants for the logistic-regression trainer.
///
/// All values are explicit so the fit is reproducible: nothing is left to a
/// solver library's silent defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// AdamW learning rate.
    pub learning_rate: f64,
    /// Hard cap on optimizer epochs (full-batch steps).
    pub max_epochs: usize,
    /// Stop when the absolute loss delta between epochs drops below this.
    pub tolerance: f64,
    /// Inverse regularization strength `C`; the applied weight decay is
    /// `1 / (C · n_samples)`.
    pub inverse_reg_strength: f64,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            max_epochs: 1000,
            tolerance: 1e-6,
            inverse_reg_strength: 1.0,
        }
    }
}

impl TrainerConfig {
    /// Validate the trainer constants.
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(PatchSegError::Config(
                "learning_rate must be > 0".to_string(),
            ));
        }
        if self.max_epochs == 0 {
            return Err(PatchSegError::Config("max_epochs must be > 0".to_string()));
        }
        if self.tolerance < 0.0 {
            return Err(PatchSegError::Config("tolerance must be >= 0".to_string()));
        }
        if self.inverse_reg_strength <= 0.0 {
            return Err(PatchSegError::Config(
                "inverse_reg_strength must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

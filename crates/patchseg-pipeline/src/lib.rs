//! Patch-aligned training pipeline for patchseg
//!
//! Trains a lightweight binary patch classifier from RGBA images whose alpha
//! channel encodes a weak foreground/background mask, using embeddings from
//! an external frozen feature extractor, and exports the result as a
//! portable ONNX graph with a dynamic patch-count input.
//!
//! # Modules
//!
//! - [`geometry`] — patch-grid math and image/mask resizing
//! - [`quantize`] — mask quantization into per-patch soft labels
//! - [`align`] — feature/label alignment and ambiguous-patch filtering
//! - [`extractor`] — the frozen feature-extractor boundary
//! - [`trainer`] — deterministic logistic-regression fitting
//! - [`export`] — ONNX serialization of the fitted classifier
//! - [`runner`] — polling worker driving runs against a dataset store
//!
//! The core entry point is [`train_classifier`]: blobs in, artifact bytes
//! out, no I/O in between. It is synchronous and strictly sequential per
//! run; independent runs share no mutable state and may execute
//! concurrently.

pub mod align;
pub mod config;
pub mod export;
pub mod extractor;
pub mod geometry;
pub mod onnx_proto;
pub mod quantize;
pub mod runner;
pub mod trainer;

pub use config::{PipelineConfig, TrainerConfig};

use patchseg_core::{ImageBlob, Result, TrainingReport};
use tracing::info;

use crate::extractor::FeatureExtractor;
use crate::trainer::LinearClassifier;

/// Everything one training run produces.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// Serialized inference graph, ready for upload.
    pub artifact_bytes: Vec<u8>,
    /// The fitted classifier the artifact was exported from.
    pub classifier: LinearClassifier,
    /// Run summary for logs and status reporting.
    pub report: TrainingReport,
}

/// Run one full training pass: align, filter, fit, export.
///
/// The run is side-effect free until it returns; a failure at any stage
/// leaves no partial artifact behind.
///
/// # Errors
///
/// Propagates the first terminal error: [`patchseg_core::PatchSegError::Config`]
/// for an invalid configuration, `InsufficientTrainingData` when no image is
/// usable or every patch is ambiguous, `Extractor` on a boundary contract
/// breach, `ClassifierFit` on degenerate statistics, and `GraphExport` if
/// serialization fails.
pub fn train_classifier(
    blobs: &[ImageBlob],
    extractor: &dyn FeatureExtractor,
    config: &PipelineConfig,
) -> Result<TrainingOutcome> {
    config.validate()?;

    let batch = align::align_batch(blobs, extractor, config)?;
    let clean = align::clean_subset(&batch, config)?;
    let (classifier, summary) = trainer::fit(&clean, &config.trainer)?;
    let artifact_bytes = export::export_classifier(&classifier)?;

    let report = TrainingReport {
        images_accepted: batch.images_accepted,
        images_skipped: batch.skips.len(),
        patches_total: batch.patch_count(),
        patches_clean: clean.len(),
        feature_dim: batch.feature_dim,
        epochs_run: summary.epochs_run,
        final_loss: summary.final_loss,
    };
    info!(
        extractor = extractor.name(),
        artifact_bytes = artifact_bytes.len(),
        %report,
        "training run complete"
    );

    Ok(TrainingOutcome {
        artifact_bytes,
        classifier,
        report,
    })
}

/// Re-export of commonly used types for downstream callers.
pub mod prelude {
    pub use crate::align::{AlignedBatch, CleanSubset, ImageSkip, SkipReason};
    pub use crate::config::{PipelineConfig, TrainerConfig};
    pub use crate::export::{GRAPH_INPUT_NAME, GRAPH_OUTPUT_NAME, IR_VERSION, OPSET_VERSION};
    pub use crate::extractor::{FeatureExtractor, MeanColorExtractor};
    pub use crate::geometry::PatchGrid;
    pub use crate::runner::{TrainingWorker, WorkerConfig};
    pub use crate::trainer::LinearClassifier;
    pub use crate::{train_classifier, TrainingOutcome};
}

//! Feature-extractor boundary.
//!
//! The pipeline treats the frozen feature extractor as an opaque function
//! with a fixed shape contract: `[1, 3, H, W]` normalized pixels in, one
//! embedding per patch out as `[1, N, feature_dim]`. Any conforming model is
//! interchangeable; the production backend runs an exported ONNX graph via
//! ONNX Runtime (behind the `ort` feature), and [`MeanColorExtractor`] is a
//! dependency-free stand-in for smoke runs and tests.

use candle_core::{Device, Tensor};
use patchseg_core::{PatchSegError, Result};

/// A frozen model mapping a normalized image tensor to per-patch embeddings.
///
/// The contract is `embed([1, 3, rows·P, cols·P]) → [1, rows·cols, D]`
/// with row-major patch ordering. Implementations must be deterministic for
/// a given input; the pipeline processes images strictly sequentially and
/// relies on stable table ordering downstream.
pub trait FeatureExtractor: Send + Sync {
    /// Embed one normalized image tensor into per-patch feature vectors.
    fn embed(&self, pixels: &Tensor) -> Result<Tensor>;

    /// Get the extractor name, for logs.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// Mean-color stand-in
// ---------------------------------------------------------------------------

/// Deterministic extractor that embeds each patch as its channel means,
/// tiled out to `feature_dim`.
///
/// Carries no model weights and no native dependencies. Useful for wiring
/// tests and pipeline smoke runs; a linear classifier trained on these
/// embeddings separates anything separable by patch color.
pub struct MeanColorExtractor {
    patch_size: usize,
    feature_dim: usize,
}

impl MeanColorExtractor {
    /// Create a stand-in extractor for the given patch stride and
    /// embedding dimension.
    pub fn new(patch_size: usize, feature_dim: usize) -> Self {
        Self {
            patch_size,
            feature_dim,
        }
    }
}

impl FeatureExtractor for MeanColorExtractor {
    fn embed(&self, pixels: &Tensor) -> Result<Tensor> {
        let (batch, channels, height, width) = pixels
            .dims4()
            .map_err(|e| PatchSegError::Extractor(format!("input shape: {e}")))?;
        if batch != 1 || channels != 3 {
            return Err(PatchSegError::Extractor(format!(
                "expected [1, 3, H, W] input, got [{batch}, {channels}, {height}, {width}]"
            )));
        }
        if height % self.patch_size != 0 || width % self.patch_size != 0 {
            return Err(PatchSegError::Extractor(format!(
                "input {height}x{width} is not a whole number of {}px patches",
                self.patch_size
            )));
        }

        let pooled = pixels
            .avg_pool2d(self.patch_size)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f32>())
            .map_err(|e| PatchSegError::Extractor(format!("patch pooling: {e}")))?;

        let patches = (height / self.patch_size) * (width / self.patch_size);
        let mut features = Vec::with_capacity(patches * self.feature_dim);
        for p in 0..patches {
            let chans = [pooled[p], pooled[patches + p], pooled[2 * patches + p]];
            features.extend((0..self.feature_dim).map(|j| chans[j % 3]));
        }

        Tensor::from_vec(features, (1, patches, self.feature_dim), &Device::Cpu)
            .map_err(|e| PatchSegError::Extractor(format!("embedding tensor: {e}")))
    }

    fn name(&self) -> &'static str {
        "MeanColorExtractor"
    }
}

// ---------------------------------------------------------------------------
// ONNX Runtime backend
// ---------------------------------------------------------------------------

#[cfg(feature = "ort")]
pub use onnx_backend::OnnxFeatureExtractor;

#[cfg(feature = "ort")]
mod onnx_backend {
    use super::FeatureExtractor;
    use candle_core::{Device, Tensor};
    use ort::session::Session;
    use patchseg_core::{PatchSegError, Result};
    use std::path::Path;
    use std::sync::Mutex;

    /// Feature extractor backed by a frozen ONNX graph (e.g. a DINOv3
    /// export) running on CPU via ONNX Runtime.
    pub struct OnnxFeatureExtractor {
        session: Mutex<Session>,
        input_name: String,
        output_name: String,
    }

    impl OnnxFeatureExtractor {
        /// Load the extractor graph from disk.
        ///
        /// # Errors
        ///
        /// Returns [`PatchSegError::Extractor`] when the graph cannot be
        /// loaded or declares no inputs/outputs.
        pub fn load(model_path: &Path) -> Result<Self> {
            let session = Session::builder()
                .and_then(|builder| builder.commit_from_file(model_path))
                .map_err(|e| {
                    PatchSegError::Extractor(format!(
                        "failed to load extractor graph {}: {e}",
                        model_path.display()
                    ))
                })?;

            let input_name = session
                .inputs
                .first()
                .map(|i| i.name.clone())
                .ok_or_else(|| {
                    PatchSegError::Extractor("extractor graph declares no inputs".to_string())
                })?;
            let output_name = session
                .outputs
                .first()
                .map(|o| o.name.clone())
                .ok_or_else(|| {
                    PatchSegError::Extractor("extractor graph declares no outputs".to_string())
                })?;

            tracing::info!(
                model = %model_path.display(),
                input = %input_name,
                output = %output_name,
                "loaded feature extractor"
            );

            Ok(Self {
                session: Mutex::new(session),
                input_name,
                output_name,
            })
        }
    }

    impl FeatureExtractor for OnnxFeatureExtractor {
        fn embed(&self, pixels: &Tensor) -> Result<Tensor> {
            let (batch, channels, height, width) = pixels
                .dims4()
                .map_err(|e| PatchSegError::Extractor(format!("input shape: {e}")))?;
            let data: Vec<f32> = pixels
                .flatten_all()
                .and_then(|t| t.to_vec1())
                .map_err(|e| PatchSegError::Extractor(format!("input readout: {e}")))?;

            let shape = [batch as i64, channels as i64, height as i64, width as i64];
            let input = ort::value::Value::from_array((shape, data))
                .map_err(|e| PatchSegError::Extractor(format!("input value: {e}")))?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| PatchSegError::Extractor("extractor session poisoned".to_string()))?;
            let outputs = session
                .run(ort::inputs![self.input_name.as_str() => input])
                .map_err(|e| PatchSegError::Extractor(format!("extractor run: {e}")))?;

            let (shape, values) = outputs[self.output_name.as_str()]
                .try_extract_tensor::<f32>()
                .map_err(|e| PatchSegError::Extractor(format!("output readout: {e}")))?;

            let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
            if dims.len() != 3 || dims[0] != 1 {
                return Err(PatchSegError::Extractor(format!(
                    "expected [1, N, D] embeddings, got {dims:?}"
                )));
            }

            Tensor::from_vec(values.to_vec(), (dims[0], dims[1], dims[2]), &Device::Cpu)
                .map_err(|e| PatchSegError::Extractor(format!("embedding tensor: {e}")))
        }

        fn name(&self) -> &'static str {
            "OnnxFeatureExtractor"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_color_shape_contract() {
        let extractor = MeanColorExtractor::new(16, 8);
        let pixels = Tensor::zeros((1, 3, 32, 48), candle_core::DType::F32, &Device::Cpu).unwrap();

        let embeddings = extractor.embed(&pixels).unwrap();
        // 2x3 grid of 16px patches.
        assert_eq!(embeddings.dims(), &[1, 6, 8]);
    }

    #[test]
    fn test_mean_color_tiles_channel_means() {
        let extractor = MeanColorExtractor::new(4, 5);
        // One 4x4 patch, channels filled with 0.1 / 0.5 / 0.9.
        let mut data = Vec::new();
        for value in [0.1f32, 0.5, 0.9] {
            data.extend(std::iter::repeat(value).take(16));
        }
        let pixels = Tensor::from_vec(data, (1, 3, 4, 4), &Device::Cpu).unwrap();

        let embeddings = extractor.embed(&pixels).unwrap();
        let row: Vec<f32> = embeddings.flatten_all().unwrap().to_vec1().unwrap();
        let expected = [0.1, 0.5, 0.9, 0.1, 0.5];
        for (got, want) in row.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_mean_color_rejects_bad_shapes() {
        let extractor = MeanColorExtractor::new(16, 8);

        let four_channel =
            Tensor::zeros((1, 4, 32, 32), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(extractor.embed(&four_channel).is_err());

        let ragged = Tensor::zeros((1, 3, 30, 32), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(extractor.embed(&ragged).is_err());
    }
}

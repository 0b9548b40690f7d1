//! Logistic-regression fitting on the clean subset.
//!
//! The model is a single linear layer with a sigmoid probability convention,
//! trained full-batch from a zero initialization. The problem is convex and
//! the data order is fixed upstream, so the fit is deterministic without
//! seeds: equal subsets and equal constants produce bit-identical weights.

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use patchseg_core::{PatchSegError, Result};
use tracing::debug;

use crate::align::CleanSubset;
use crate::config::TrainerConfig;

/// A fitted binary linear decision function over the embedding dimension.
///
/// Scores are `w · x + b`; probabilities apply a sigmoid to the score; the
/// predicted class is `probability > 0.5`, equivalently `score > 0`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearClassifier {
    /// Weight vector, one entry per embedding dimension.
    pub weights: Vec<f32>,
    /// Bias term.
    pub bias: f32,
}

impl LinearClassifier {
    /// Embedding dimension this classifier scores.
    pub fn feature_dim(&self) -> usize {
        self.weights.len()
    }

    /// Linear score `w · x + b` for one embedding.
    pub fn decision_function(&self, features: &[f32]) -> f32 {
        debug_assert_eq!(features.len(), self.weights.len());
        self.weights
            .iter()
            .zip(features.iter())
            .map(|(w, x)| w * x)
            .sum::<f32>()
            + self.bias
    }

    /// Foreground probability: sigmoid over the linear score.
    pub fn probability(&self, features: &[f32]) -> f32 {
        1.0 / (1.0 + (-self.decision_function(features)).exp())
    }

    /// Predicted class (`true` = foreground).
    pub fn predict(&self, features: &[f32]) -> bool {
        self.decision_function(features) > 0.0
    }
}

/// Optimizer outcome for the run report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitSummary {
    /// Epochs run before convergence or the epoch cap.
    pub epochs_run: usize,
    /// Final full-batch loss.
    pub final_loss: f64,
}

/// Fit a binary logistic-regression classifier on the clean subset.
///
/// Labels binarize as `label > 0.5`. Optimization is full-batch AdamW with
/// decoupled weight decay `1 / (C · n)`, stopping when the absolute loss
/// delta between epochs drops below the configured tolerance.
///
/// # Errors
///
/// Returns [`PatchSegError::ClassifierFit`] on degenerate input: a zero
/// feature dimension, an empty subset, a single class present, or a
/// non-finite loss during optimization.
pub fn fit(subset: &CleanSubset, config: &TrainerConfig) -> Result<(LinearClassifier, FitSummary)> {
    let n = subset.len();
    let dim = subset.feature_dim;
    if dim == 0 {
        return Err(PatchSegError::ClassifierFit(
            "zero feature dimension".to_string(),
        ));
    }
    if n == 0 {
        return Err(PatchSegError::ClassifierFit(
            "empty training subset".to_string(),
        ));
    }

    let targets: Vec<f32> = subset
        .labels
        .iter()
        .map(|&l| if l > 0.5 { 1.0 } else { 0.0 })
        .collect();
    let positives = targets.iter().filter(|&&t| t > 0.5).count();
    if positives == 0 || positives == n {
        return Err(PatchSegError::ClassifierFit(format!(
            "single class in training subset: {positives} of {n} patches are foreground"
        )));
    }

    let device = Device::Cpu;
    let inputs = Tensor::from_vec(subset.features.clone(), (n, dim), &device)
        .map_err(|e| PatchSegError::ClassifierFit(format!("input tensor: {e}")))?;
    let labels = Tensor::from_vec(targets, (n, 1), &device)
        .map_err(|e| PatchSegError::ClassifierFit(format!("label tensor: {e}")))?;

    let weight = Var::zeros((dim, 1), DType::F32, &device)
        .map_err(|e| PatchSegError::ClassifierFit(format!("weight init: {e}")))?;
    let bias = Var::zeros(1, DType::F32, &device)
        .map_err(|e| PatchSegError::ClassifierFit(format!("bias init: {e}")))?;

    let weight_decay = 1.0 / (config.inverse_reg_strength * n as f64);
    let mut optimizer = AdamW::new(
        vec![weight.clone(), bias.clone()],
        ParamsAdamW {
            lr: config.learning_rate,
            weight_decay,
            ..Default::default()
        },
    )
    .map_err(|e| PatchSegError::ClassifierFit(format!("optimizer init: {e}")))?;

    let mut previous_loss = f64::MAX;
    let mut epochs_run = config.max_epochs;
    let mut final_loss = f64::MAX;

    for epoch in 0..config.max_epochs {
        let logits = inputs
            .matmul(weight.as_tensor())
            .and_then(|t| t.broadcast_add(bias.as_tensor()))
            .map_err(|e| PatchSegError::ClassifierFit(format!("forward pass: {e}")))?;
        let loss = candle_nn::loss::binary_cross_entropy_with_logit(&logits, &labels)
            .map_err(|e| PatchSegError::ClassifierFit(format!("loss: {e}")))?;

        let loss_val = f64::from(
            loss.to_scalar::<f32>()
                .map_err(|e| PatchSegError::ClassifierFit(format!("loss readout: {e}")))?,
        );
        if !loss_val.is_finite() {
            return Err(PatchSegError::ClassifierFit(format!(
                "non-finite loss at epoch {epoch}: degenerate feature matrix"
            )));
        }

        optimizer
            .backward_step(&loss)
            .map_err(|e| PatchSegError::ClassifierFit(format!("optimizer step: {e}")))?;

        final_loss = loss_val;
        if (previous_loss - loss_val).abs() < config.tolerance {
            epochs_run = epoch + 1;
            break;
        }
        previous_loss = loss_val;
    }

    let weights: Vec<f32> = weight
        .as_tensor()
        .flatten_all()
        .and_then(|t| t.to_vec1())
        .map_err(|e| PatchSegError::ClassifierFit(format!("weight readout: {e}")))?;
    let bias_val: f32 = bias
        .as_tensor()
        .flatten_all()
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| PatchSegError::ClassifierFit(format!("bias readout: {e}")))?[0];

    debug!(
        samples = n,
        dim,
        epochs_run,
        final_loss,
        "fitted linear classifier"
    );

    Ok((
        LinearClassifier {
            weights,
            bias: bias_val,
        },
        FitSummary {
            epochs_run,
            final_loss,
        },
    ))
}

use serde::{Deserialize, Serialize};
use shared::TaskKind;
use std::path::PathBuf;

use crate::inference::DecodedImage;

/// Where a task's model lives and how to name its outputs. Index `i` of the
/// model's class distribution is `labels[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub path: PathBuf,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: String,
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// Picks the arg-max class of `probabilities`. NaN or infinite scores are
    /// rejected rather than ranked.
    pub fn from_probabilities(
        labels: &[String],
        probabilities: Vec<f32>,
    ) -> Result<Self, PredictError> {
        if probabilities.is_empty() || probabilities.len() != labels.len() {
            return Err(PredictError::LabelMismatch {
                labels: labels.len(),
                outputs: probabilities.len(),
            });
        }
        if let Some(index) = probabilities.iter().position(|p| !p.is_finite()) {
            return Err(PredictError::NonFinite { index });
        }
        let (index, _) = probabilities
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .ok_or(PredictError::LabelMismatch {
                labels: labels.len(),
                outputs: 0,
            })?;
        Ok(Self {
            label: labels[index].clone(),
            probabilities,
        })
    }

    /// Highest class probability.
    pub fn confidence(&self) -> f32 {
        self.probabilities
            .iter()
            .copied()
            .fold(0.0_f32, f32::max)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("Model artifact not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("Model artifact {} could not be loaded: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
    #[error("Insufficient memory to load model artifact")]
    ResourceExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("Invalid model input: {0}")]
    InvalidInput(String),
    #[error("Model produced {outputs} scores for {labels} labels")]
    LabelMismatch { labels: usize, outputs: usize },
    #[error("Model produced a non-finite score at index {index}")]
    NonFinite { index: usize },
    #[error("Model error: {0}")]
    Backend(String),
    #[error("Insufficient resources during inference")]
    ResourceExhausted,
}

/// A loaded, inference-ready model.
pub trait ModelHandle: Send + Sync {
    fn predict(&self, input: &DecodedImage) -> Result<Prediction, PredictError>;
}

/// Loads model artifacts and reclaims the memory they leave behind.
pub trait ModelBackend: Send + Sync {
    /// The returned model must already be in evaluation mode.
    fn load(&self, task: TaskKind, spec: &ArtifactSpec) -> Result<Box<dyn ModelHandle>, LoadError>;

    /// Runs right after a resident model has been dropped.
    fn reclaim(&self) {}

    /// Runs once after every batch.
    fn clear_transient(&self) {}
}

/// Allocator failures surface as plain error strings from the native runtime.
pub fn is_out_of_memory(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("out of memory")
        || message.contains("can't allocate")
        || message.contains("cannot allocate")
        || message.contains("bad_alloc")
}

use shared::{InferenceRecord, ItemStatus};
use std::path::{Path, PathBuf};

use super::preprocess::DecodeError;
use crate::model::PredictError;
use crate::storage::StorageError;

pub const ERROR_LABEL: &str = "Error";
pub const NO_CONFIDENCE: &str = "N/A";

/// Why a single image in a batch produced no prediction.
#[derive(Debug, thiserror::Error)]
pub enum ItemFailure {
    #[error("staging failed: {0}")]
    Staging(#[source] StorageError),
    #[error("decode failed: {0}")]
    Decode(#[source] DecodeError),
    #[error("inference failed: {0}")]
    Inference(#[source] PredictError),
}

impl ItemFailure {
    /// Reason shown to clients. Backend detail stays in the log.
    pub fn client_message(&self) -> &'static str {
        match self {
            ItemFailure::Staging(StorageError::FileTooLarge { .. }) => {
                "image exceeds the upload size limit"
            }
            ItemFailure::Staging(StorageError::Empty) => "image is empty",
            ItemFailure::Staging(_) => "image could not be stored",
            ItemFailure::Decode(_) => "image could not be decoded",
            ItemFailure::Inference(_) => "model could not classify the image",
        }
    }
}

#[derive(Debug)]
pub enum ItemOutcome {
    Success {
        label: String,
        confidence: f32,
        path: PathBuf,
    },
    Failed {
        path: Option<PathBuf>,
        failure: ItemFailure,
    },
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }

    pub fn into_record(self) -> InferenceRecord {
        match self {
            ItemOutcome::Success {
                label,
                confidence,
                path,
            } => InferenceRecord {
                prediction: label,
                confidence: format_confidence(confidence),
                image_path: Some(display_path(&path)),
                status: ItemStatus::Success,
                detail: None,
            },
            ItemOutcome::Failed { path, failure } => InferenceRecord {
                prediction: ERROR_LABEL.to_string(),
                confidence: NO_CONFIDENCE.to_string(),
                image_path: path.as_deref().map(display_path),
                status: ItemStatus::PerItemError,
                detail: Some(failure.client_message().to_string()),
            },
        }
    }
}

/// `0.8734` becomes `"87.34%"`.
pub fn format_confidence(probability: f32) -> String {
    format!("{:.2}%", probability * 100.0)
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

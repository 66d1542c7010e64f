use log::{error, info, warn};
use shared::{BatchResponse, InferenceRecord};
use std::sync::Arc;
use std::time::Instant;

use super::outcome::{ItemFailure, ItemOutcome};
use super::preprocess::Preprocessor;
use crate::error::BatchError;
use crate::model::{ModelCache, ModelHandle, PredictError};
use crate::storage::{UploadStore, extension_for_upload};

/// One uploaded image as received from the client.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
}

impl ImageUpload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            content_type: None,
            file_name: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    fn extension(&self) -> &'static str {
        extension_for_upload(self.content_type.as_deref(), self.file_name.as_deref())
    }
}

/// Classifies batches of images against the model for one task.
pub struct InferencePipeline {
    cache: Arc<ModelCache>,
    store: Arc<dyn UploadStore>,
    preprocessor: Preprocessor,
}

impl InferencePipeline {
    pub fn new(cache: Arc<ModelCache>, store: Arc<dyn UploadStore>, preprocessor: Preprocessor) -> Self {
        Self {
            cache,
            store,
            preprocessor,
        }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Runs every image through the model for `task`.
    ///
    /// Returns one record per image, in submission order, or a single
    /// [`BatchError`] and no records at all. A bad image only spoils its own
    /// record.
    pub fn run_batch(&self, task: &str, images: &[ImageUpload]) -> Result<BatchResponse, BatchError> {
        if task.trim().is_empty() {
            return Err(BatchError::Validation("no task selected".to_string()));
        }
        if images.is_empty() {
            return Err(BatchError::Validation("no images uploaded".to_string()));
        }

        let started = Instant::now();
        let model = self.cache.acquire(task).map_err(|e| {
            error!("Batch rejected for task '{}': {}", task.trim(), e);
            BatchError::from(e)
        })?;
        let kind = model.task();
        info!("Running batch of {} image(s) for task '{}'", images.len(), kind);

        let outcomes = self.classify_all(&*model, images);
        drop(model);
        self.cache.clear_transient();
        let outcomes = outcomes?;

        let failures = outcomes.iter().filter(|o| !o.is_success()).count();
        let results: Vec<InferenceRecord> = outcomes.into_iter().map(ItemOutcome::into_record).collect();
        info!(
            "Batch for task '{}' finished in {} ms: {} ok, {} failed",
            kind,
            started.elapsed().as_millis(),
            results.len() - failures,
            failures
        );
        Ok(BatchResponse { task: kind, results })
    }

    fn classify_all(
        &self,
        model: &dyn ModelHandle,
        images: &[ImageUpload],
    ) -> Result<Vec<ItemOutcome>, BatchError> {
        let mut outcomes = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let outcome = self.classify(model, image)?;
            if let ItemOutcome::Failed { failure, .. } = &outcome {
                warn!("Image {} in batch failed: {}", index, failure);
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Only resource exhaustion escapes as an error; everything else becomes
    /// a failed outcome for this image.
    fn classify(&self, model: &dyn ModelHandle, image: &ImageUpload) -> Result<ItemOutcome, BatchError> {
        let staged = match self.store.stage(&image.bytes, image.extension()) {
            Ok(staged) => staged,
            Err(e) => {
                return Ok(ItemOutcome::Failed {
                    path: None,
                    failure: ItemFailure::Staging(e),
                });
            }
        };

        let prediction = match self.preprocessor.decode_file(&staged.path) {
            Ok(decoded) => model.predict(&decoded),
            Err(e) => {
                return Ok(ItemOutcome::Failed {
                    path: Some(staged.path),
                    failure: ItemFailure::Decode(e),
                });
            }
        };

        match prediction {
            Ok(prediction) => Ok(ItemOutcome::Success {
                confidence: prediction.confidence(),
                label: prediction.label,
                path: staged.path,
            }),
            Err(PredictError::ResourceExhausted) => {
                error!("Inference ran out of resources on {}", staged.path.display());
                Err(BatchError::InsufficientResources)
            }
            Err(e) => Ok(ItemOutcome::Failed {
                path: Some(staged.path),
                failure: ItemFailure::Inference(e),
            }),
        }
    }
}

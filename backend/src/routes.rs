use actix_files::Files;
use actix_multipart::Multipart;
use actix_web::{Error, HttpResponse, error, web};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use log::{debug, info};
use serde_json::json;
use shared::{TaskInfo, TaskKind};
use std::path::PathBuf;
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::config::StorageConfig;
use crate::error::BatchError;
use crate::inference::{ImageUpload, InferencePipeline};

/// Bounds on what one predict request may buffer.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_file_bytes: usize,
    pub max_images: usize,
    pub max_batch_bytes: usize,
}

impl From<&StorageConfig> for UploadLimits {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            max_file_bytes: storage.max_file_bytes,
            max_images: storage.max_images,
            max_batch_bytes: storage.max_batch_bytes,
        }
    }
}

pub struct AppState {
    pub pipeline: Arc<InferencePipeline>,
    pub limits: UploadLimits,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pipeline: Arc<InferencePipeline>, limits: UploadLimits) -> Self {
        Self {
            pipeline,
            limits,
            started_at: Utc::now(),
        }
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, upload_dir: PathBuf) {
    cfg.service(web::resource("/api/predict").route(web::post().to(handle_inference)))
        .service(web::resource("/api/tasks").route(web::get().to(list_tasks)))
        .service(web::resource("/api/health").route(web::get().to(health)))
        .service(Files::new("/static/uploads", upload_dir));
}

struct InferenceForm {
    task: String,
    images: Vec<ImageUpload>,
}

async fn read_form(payload: &mut Multipart, limits: UploadLimits) -> Result<InferenceForm, Error> {
    let mut task = String::new();
    let mut images = Vec::new();
    let mut total_bytes = 0usize;

    while let Some(mut field) = payload.try_next().await? {
        let disposition = field.content_disposition();
        let name = disposition
            .and_then(|cd| cd.get_name())
            .unwrap_or_default()
            .to_string();
        let file_name = disposition
            .and_then(|cd| cd.get_filename())
            .map(str::to_string);
        let content_type = field.content_type().map(|mime| mime.essence_str().to_string());

        let mut data = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if data.len() + chunk.len() > limits.max_file_bytes {
                return Err(error::ErrorPayloadTooLarge(format!(
                    "field '{}' exceeds the {} byte limit",
                    name, limits.max_file_bytes
                )));
            }
            total_bytes += chunk.len();
            if total_bytes > limits.max_batch_bytes {
                return Err(error::ErrorPayloadTooLarge(format!(
                    "request exceeds the {} byte limit",
                    limits.max_batch_bytes
                )));
            }
            data.extend_from_slice(&chunk);
        }

        match name.as_str() {
            "task" => task = String::from_utf8_lossy(&data).trim().to_string(),
            // browsers send an empty part when no file was picked
            "images" if data.is_empty() => {}
            "images" if images.len() >= limits.max_images => {
                return Err(error::ErrorPayloadTooLarge(format!(
                    "at most {} images per request",
                    limits.max_images
                )));
            }
            "images" => images.push(ImageUpload {
                bytes: data,
                content_type,
                file_name,
            }),
            other => debug!("Ignoring multipart field '{}'", other),
        }
    }

    Ok(InferenceForm { task, images })
}

async fn handle_inference(
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let form = read_form(&mut payload, state.limits).await?;
    info!(
        "Inference request for task '{}' with {} image(s)",
        form.task,
        form.images.len()
    );

    let pipeline = state.pipeline.clone();
    let response = web::block(move || pipeline.run_batch(&form.task, &form.images))
        .await
        .map_err(|e| BatchError::Internal(e.to_string()))??;

    Ok(HttpResponse::Ok().json(response))
}

async fn list_tasks(state: web::Data<AppState>) -> HttpResponse {
    let cache = state.pipeline.cache();
    let resident = cache.resident().map(|r| r.task);
    let tasks: Vec<TaskInfo> = TaskKind::iter()
        .filter_map(|task| {
            cache.registry().spec(task).map(|spec| TaskInfo {
                task,
                labels: spec.labels.clone(),
                resident: resident == Some(task),
            })
        })
        .collect();
    HttpResponse::Ok().json(tasks)
}

async fn health(state: web::Data<AppState>) -> HttpResponse {
    let cache = state.pipeline.cache();
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "started_at": state.started_at.to_rfc3339(),
        "resident": cache.resident(),
        "cache": cache.stats(),
    }))
}

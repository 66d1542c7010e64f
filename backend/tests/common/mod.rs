#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use medvision::config::ImageConfig;
use medvision::inference::{DecodedImage, ImageUpload, InferencePipeline, Preprocessor};
use medvision::model::{
    ArtifactSpec, LoadError, ModelBackend, ModelCache, ModelHandle, ModelRegistry, PredictError,
    Prediction,
};
use medvision::storage::LocalUploadStore;
use shared::TaskKind;
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use strum::IntoEnumIterator;
use tempfile::TempDir;

pub const MAX_FILE_BYTES: usize = 1024 * 1024;

#[derive(Default)]
pub struct Counters {
    pub loads: AtomicUsize,
    pub reclaims: AtomicUsize,
    pub transient_clears: AtomicUsize,
    pub predictions: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// What the fake model should do on a given predict call (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Fail,
    Exhaust,
    NanScores,
}

pub struct FakeBackend {
    pub counters: Arc<Counters>,
    pub failing_loads: Arc<Mutex<BTreeMap<TaskKind, fn() -> LoadError>>>,
    pub script: Arc<Mutex<BTreeMap<usize, Script>>>,
}

struct FakeModel {
    labels: Vec<String>,
    counters: Arc<Counters>,
    script: Arc<Mutex<BTreeMap<usize, Script>>>,
}

impl ModelHandle for FakeModel {
    fn predict(&self, input: &DecodedImage) -> Result<Prediction, PredictError> {
        let call = self.counters.predictions.fetch_add(1, Ordering::SeqCst);
        match self.script.lock().unwrap().get(&call) {
            Some(Script::Fail) => return Err(PredictError::Backend("scripted failure".into())),
            Some(Script::Exhaust) => return Err(PredictError::ResourceExhausted),
            Some(Script::NanScores) => {
                return Prediction::from_probabilities(&self.labels, vec![0.1, f32::NAN]);
            }
            None => {}
        }
        // bright images lean towards the second label
        let mean = input.tensor().mean().unwrap_or(0.0).clamp(0.0, 1.0);
        let high = 0.5 + mean * 0.4;
        Prediction::from_probabilities(&self.labels, vec![1.0 - high, high])
    }
}

impl ModelBackend for FakeBackend {
    fn load(&self, task: TaskKind, spec: &ArtifactSpec) -> Result<Box<dyn ModelHandle>, LoadError> {
        if let Some(make_error) = self.failing_loads.lock().unwrap().get(&task) {
            return Err(make_error());
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeModel {
            labels: spec.labels.clone(),
            counters: self.counters.clone(),
            script: self.script.clone(),
        }))
    }

    fn reclaim(&self) {
        self.counters.reclaims.fetch_add(1, Ordering::SeqCst);
    }

    fn clear_transient(&self) {
        self.counters.transient_clears.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct Harness {
    pub pipeline: Arc<InferencePipeline>,
    pub counters: Arc<Counters>,
    pub failing_loads: Arc<Mutex<BTreeMap<TaskKind, fn() -> LoadError>>>,
    pub script: Arc<Mutex<BTreeMap<usize, Script>>>,
    pub upload_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let artifacts: BTreeMap<_, _> = TaskKind::iter()
            .map(|task| {
                let spec = ArtifactSpec {
                    path: PathBuf::from(format!("models/{}.pt", task)),
                    labels: vec!["NORMAL".into(), "ABNORMAL".into()],
                };
                (task, spec)
            })
            .collect();

        let counters = Arc::new(Counters::default());
        let failing_loads = Arc::new(Mutex::new(BTreeMap::new()));
        let script = Arc::new(Mutex::new(BTreeMap::new()));
        let backend = FakeBackend {
            counters: counters.clone(),
            failing_loads: failing_loads.clone(),
            script: script.clone(),
        };
        let cache = Arc::new(ModelCache::new(
            ModelRegistry::new(artifacts).unwrap(),
            Box::new(backend),
        ));

        let upload_dir = tempfile::tempdir().unwrap();
        let store = LocalUploadStore::create(upload_dir.path(), MAX_FILE_BYTES).unwrap();
        let image_config = ImageConfig {
            size: vec![16, 16],
            ..ImageConfig::default()
        };
        let pipeline = Arc::new(InferencePipeline::new(
            cache,
            Arc::new(store),
            Preprocessor::new(&image_config),
        ));

        Self {
            pipeline,
            counters,
            failing_loads,
            script,
            upload_dir,
        }
    }

    pub fn staged_files(&self) -> usize {
        std::fs::read_dir(self.upload_dir.path()).unwrap().count()
    }
}

pub fn png_bytes(color: [u8; 3]) -> Vec<u8> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 24, Rgb(color)))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn jpeg_upload(color: [u8; 3]) -> ImageUpload {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(RgbImage::from_pixel(24, 24, Rgb(color)))
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    ImageUpload::new(bytes)
        .with_content_type("image/jpeg")
        .with_file_name("scan.jpg")
}

pub fn png_upload(color: [u8; 3]) -> ImageUpload {
    ImageUpload::new(png_bytes(color)).with_content_type("image/png")
}

pub fn corrupt_upload() -> ImageUpload {
    ImageUpload::new(b"\xff\xd8\xff\xe0 truncated jpeg".to_vec()).with_content_type("image/jpeg")
}

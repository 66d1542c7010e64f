use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use shared::TaskKind;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;

use crate::model::ArtifactSpec;

pub const DEFAULT_CONFIG_PATH: &str = "config/server.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("No model configured for task '{0}'")]
    MissingModel(TaskKind),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub version: f32,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(deserialize_with = "unique_models")]
    pub models: BTreeMap<TaskKind, ArtifactSpec>,
    /// Task whose model is loaded before the server starts accepting requests.
    #[serde(default)]
    pub preload: Option<TaskKind>,
}

/// Task keys have aliases (`eye` / `eye_defect`), so two keys in the file can
/// name the same task. That is rejected instead of letting the last one win.
fn unique_models<'de, D>(deserializer: D) -> Result<BTreeMap<TaskKind, ArtifactSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ModelsVisitor;

    impl<'de> Visitor<'de> for ModelsVisitor {
        type Value = BTreeMap<TaskKind, ArtifactSpec>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of task names to model artifacts")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut models = BTreeMap::new();
            while let Some((task, spec)) = map.next_entry::<TaskKind, ArtifactSpec>()? {
                if models.insert(task, spec).is_some() {
                    return Err(de::Error::custom(format!(
                        "task '{}' is configured more than once",
                        task
                    )));
                }
            }
            Ok(models)
        }
    }

    deserializer.deserialize_map(ModelsVisitor)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub max_file_bytes: usize,
    /// Upper bound on image parts in one request.
    pub max_images: usize,
    /// Upper bound on all multipart data buffered for one request.
    pub max_batch_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("static/uploads"),
            max_file_bytes: 50 * 1024 * 1024,
            max_images: 32,
            max_batch_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    CudaIfAvailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub device: DeviceKind,
    pub num_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            device: DeviceKind::Cpu,
            num_threads: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// `[width, height]` fed to the model.
    pub size: Vec<u32>,
    pub channels: u32,
    pub preprocessing: PreprocessingConfig,
    pub normalization: NormalizationConfig,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            size: vec![224, 224],
            channels: 3,
            preprocessing: PreprocessingConfig::default(),
            normalization: NormalizationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub resize_method: ResizeMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMethod {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Gaussian,
    Lanczos3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationConfig {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl Default for NormalizationConfig {
    // ImageNet statistics
    fn default() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }
}

impl AppConfig {
    /// Reads the file named by `MEDVISION_CONFIG` (or the default path),
    /// applies environment overrides and validates the result.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("MEDVISION_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::parse(&Self::read(Path::new(&path))?)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&Self::read(path)?)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(yaml)?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<String, ConfigError> {
        std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })
    }

    fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Overrides taken from the process environment: `HOST`, `PORT`,
    /// `UPLOAD_DIR`, `NUM_THREADS`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("PORT is not a valid port: {}", port)))?;
        }
        if let Some(dir) = lookup("UPLOAD_DIR") {
            self.storage.upload_dir = PathBuf::from(dir);
        }
        if let Some(threads) = lookup("NUM_THREADS") {
            self.runtime.num_threads = threads.parse().map_err(|_| {
                ConfigError::Invalid(format!("NUM_THREADS is not a number: {}", threads))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for task in TaskKind::iter() {
            let spec = self.models.get(&task).ok_or(ConfigError::MissingModel(task))?;
            if spec.path.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!("model path for '{}' is empty", task)));
            }
            if spec.labels.is_empty() {
                return Err(ConfigError::Invalid(format!("model '{}' has no class labels", task)));
            }
        }

        let image = &self.image;
        if image.size.len() != 2 || image.size.iter().any(|&d| d == 0) {
            return Err(ConfigError::Invalid(format!(
                "image.size must be [width, height] with non-zero values, got {:?}",
                image.size
            )));
        }
        if image.channels != 1 && image.channels != 3 {
            return Err(ConfigError::Invalid(format!(
                "image.channels must be 1 or 3, got {}",
                image.channels
            )));
        }
        let channels = image.channels as usize;
        let norm = &image.normalization;
        if norm.mean.len() != channels || norm.std.len() != channels {
            return Err(ConfigError::Invalid(format!(
                "normalization mean/std need {} values each",
                channels
            )));
        }
        if norm.std.iter().any(|&s| s == 0.0) {
            return Err(ConfigError::Invalid("normalization std must be non-zero".to_string()));
        }

        if self.runtime.num_threads == 0 {
            return Err(ConfigError::Invalid("runtime.num_threads must be at least 1".to_string()));
        }
        let storage = &self.storage;
        if storage.max_file_bytes == 0 || storage.max_images == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_file_bytes and storage.max_images must be positive".to_string(),
            ));
        }
        if storage.max_batch_bytes < storage.max_file_bytes {
            return Err(ConfigError::Invalid(format!(
                "storage.max_batch_bytes ({}) is smaller than storage.max_file_bytes ({})",
                storage.max_batch_bytes, storage.max_file_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: 1.0
server:
  port: 9000
storage:
  upload_dir: /tmp/uploads
runtime:
  num_threads: 2
image:
  size: [128, 128]
  channels: 1
  preprocessing:
    resize_method: lanczos3
  normalization:
    mean: [0.5]
    std: [0.25]
models:
  mammogram:
    path: models/mammogram_model.pt
    labels: [benign, malignant]
  xray:
    path: models/Chest_Xray.pt
    labels: [NORMAL, PNEUMONIA]
  eye:
    path: models/Eyes_Defects_model.pt
    labels: [cataract, glaucoma, normal]
preload: xray
"#;

    #[test]
    fn parses_full_config() {
        let config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.storage.upload_dir, PathBuf::from("/tmp/uploads"));
        assert_eq!(config.runtime.num_threads, 2);
        assert_eq!(config.runtime.device, DeviceKind::Cpu);
        assert_eq!(config.image.preprocessing.resize_method, ResizeMethod::Lanczos3);
        assert_eq!(config.preload, Some(TaskKind::ChestXray));
        assert_eq!(config.models[&TaskKind::EyeDefect].labels.len(), 3);
    }

    #[test]
    fn missing_task_is_rejected() {
        // alias still resolves to the same task
        let yaml = SAMPLE.replace("  eye:\n", "  eye_defect:\n");
        assert!(AppConfig::from_yaml_str(&yaml).is_ok());

        let trimmed: String = SAMPLE
            .lines()
            .filter(|line| !line.contains("mammogram") && !line.contains("benign"))
            .collect::<Vec<_>>()
            .join("\n");
        match AppConfig::from_yaml_str(&trimmed) {
            Err(ConfigError::MissingModel(TaskKind::Mammogram)) => {}
            other => panic!("expected missing mammogram model, got {:?}", other),
        }
    }

    #[test]
    fn aliased_duplicate_task_is_rejected() {
        let yaml = SAMPLE.replace(
            "preload: xray",
            "  eye_defect:\n    path: models/other_eye.pt\n    labels: [normal]\npreload: xray",
        );
        match AppConfig::from_yaml_str(&yaml) {
            Err(ConfigError::Parse(e)) => assert!(e.to_string().contains("more than once"), "{}", e),
            other => panic!("expected duplicate task error, got {:?}", other),
        }
    }

    #[test]
    fn unknown_task_key_fails_to_parse() {
        let yaml = SAMPLE.replace("  eye:\n", "  skin:\n");
        assert!(matches!(AppConfig::from_yaml_str(&yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn normalization_must_match_channels() {
        let yaml = SAMPLE.replace("channels: 1", "channels: 3");
        assert!(matches!(AppConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn batch_limit_must_cover_one_file() {
        let config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.storage.max_images, 32);

        let yaml = SAMPLE.replace(
            "  upload_dir: /tmp/uploads\n",
            "  upload_dir: /tmp/uploads\n  max_file_bytes: 2048\n  max_batch_bytes: 1024\n",
        );
        assert!(matches!(AppConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))));

        let yaml = SAMPLE.replace(
            "  upload_dir: /tmp/uploads\n",
            "  upload_dir: /tmp/uploads\n  max_images: 0\n",
        );
        assert!(matches!(AppConfig::from_yaml_str(&yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AppConfig::from_yaml_str(SAMPLE).unwrap();
        config
            .apply_overrides(|key| match key {
                "PORT" => Some("8088".to_string()),
                "UPLOAD_DIR" => Some("uploads".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.storage.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.runtime.num_threads, 2);

        let bad = config.apply_overrides(|key| (key == "PORT").then(|| "http".to_string()));
        assert!(matches!(bad, Err(ConfigError::Invalid(_))));
    }
}

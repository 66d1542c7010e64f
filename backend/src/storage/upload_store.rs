use log::debug;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const DEFAULT_EXTENSION: &str = "jpg";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("File too large: {size} bytes exceeds the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },
    #[error("Empty upload")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub path: PathBuf,
}

/// Persists uploads under names nobody else can collide with.
pub trait UploadStore: Send + Sync {
    fn stage(&self, data: &[u8], extension: &str) -> Result<StagedFile, StorageError>;
}

#[derive(Debug, Clone)]
pub struct LocalUploadStore {
    root: PathBuf,
    max_file_bytes: usize,
}

impl LocalUploadStore {
    pub fn new(root: impl Into<PathBuf>, max_file_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_file_bytes,
        }
    }

    /// Like [`LocalUploadStore::new`], creating the directory if needed.
    pub fn create(root: impl Into<PathBuf>, max_file_bytes: usize) -> std::io::Result<Self> {
        let store = Self::new(root, max_file_bytes);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn generate_file_name(extension: &str) -> String {
        format!("{}.{}", Uuid::new_v4().simple(), sanitize_extension(extension))
    }

    pub fn validate_image_size(&self, data: &[u8]) -> Result<(), StorageError> {
        if data.is_empty() {
            return Err(StorageError::Empty);
        }
        if data.len() > self.max_file_bytes {
            return Err(StorageError::FileTooLarge {
                size: data.len(),
                limit: self.max_file_bytes,
            });
        }
        Ok(())
    }
}

impl UploadStore for LocalUploadStore {
    fn stage(&self, data: &[u8], extension: &str) -> Result<StagedFile, StorageError> {
        self.validate_image_size(data)?;

        let path = self.root.join(Self::generate_file_name(extension));
        let write = |path: &Path| -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
            file.write_all(data)?;
            file.flush()
        };
        write(&path).map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;

        debug!("Staged {} bytes at {}", data.len(), path.display());
        Ok(StagedFile { path })
    }
}

pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/bmp" => Some("bmp"),
        "image/tiff" => Some("tiff"),
        _ => None,
    }
}

/// Picks a file extension from the declared content type, then the client's
/// file name, falling back to `jpg`.
pub fn extension_for_upload(content_type: Option<&str>, file_name: Option<&str>) -> &'static str {
    content_type
        .and_then(extension_for_mime)
        .or_else(|| {
            let ext = Path::new(file_name?).extension()?.to_str()?.to_ascii_lowercase();
            match ext.as_str() {
                "jpg" | "jpeg" => Some("jpg"),
                "png" => Some("png"),
                "webp" => Some("webp"),
                "gif" => Some("gif"),
                "bmp" => Some("bmp"),
                "tif" | "tiff" => Some("tiff"),
                _ => None,
            }
        })
        .unwrap_or(DEFAULT_EXTENSION)
}

fn sanitize_extension(extension: &str) -> String {
    let ext: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    if ext.is_empty() {
        DEFAULT_EXTENSION.to_string()
    } else {
        ext
    }
}

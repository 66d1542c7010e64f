pub mod upload_store;

pub use upload_store::{
    LocalUploadStore, StagedFile, StorageError, UploadStore, extension_for_mime, extension_for_upload,
};

pub mod artifact;
pub mod cache;
pub mod registry;
#[cfg(feature = "torch")]
pub mod torch;

pub use artifact::{
    ArtifactSpec, LoadError, ModelBackend, ModelHandle, PredictError, Prediction, is_out_of_memory,
};
pub use cache::{CacheError, CacheStatsSnapshot, ModelCache, ModelLease, ResidentInfo};
pub use registry::ModelRegistry;

pub mod outcome;
pub mod pipeline;
pub mod preprocess;

pub use outcome::{ItemFailure, ItemOutcome, format_confidence};
pub use pipeline::{ImageUpload, InferencePipeline};
pub use preprocess::{DecodeError, DecodedImage, Preprocessor};

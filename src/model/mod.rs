pub mod config;
pub mod model_metadata;
pub mod model_storage;

pub use config::PipelineConfig;
pub use model_metadata::{Algorithm, BundleMetadata};
pub use model_storage::{describe_metadata, load_metadata, load_model, save_model, Bundled};

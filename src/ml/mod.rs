pub mod dataset;
pub mod kernel;
mod linalg;
pub mod metrics;
pub mod pca;
pub mod pipeline;
pub mod svm;

pub use dataset::{Dataset, DroppedSample, LoadReport};
pub use kernel::Kernel;
pub use metrics::ClassificationReport;
pub use pca::Pca;
pub use pipeline::Pipeline;
pub use svm::{FitInfo, Svm};

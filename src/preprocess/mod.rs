pub mod preprocessor;

pub use preprocessor::{normalize_unit_range, Preprocessor};

//! ゲーム録画フレームのイベント分類パイプライン
//!
//! 画像前処理 → PCA による次元削減 → SVM による二値分類を行い、
//! 学習済みモデルを tar.gz バンドルおよび ONNX 形式で保存します。

pub mod commands;
pub mod detect;
pub mod error;
pub mod export;
pub mod ml;
pub mod model;
pub mod preprocess;
pub mod runner;
pub mod types;

pub use error::{PipelineError, Result};
pub use types::Label;

//! パイプライン共通のエラー型

use std::path::PathBuf;

use thiserror::Error;

use crate::types::Label;

/// ライブラリ全体で使用するエラー
#[derive(Debug, Error)]
pub enum PipelineError {
    /// 前処理後の特徴ベクトル長が期待値と一致しない（ローダーはスキップして報告する）
    #[error("shape mismatch for {path:?}: expected {expected} values, got {actual}")]
    ShapeMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image {path:?}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("dimension mismatch: expected width {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid label value: {0}")]
    InvalidLabel(i64),

    #[error("dataset is empty")]
    EmptyDataset,

    #[error("training data only contains class {0}")]
    SingleClass(Label),

    /// エクスポート時にグラフ間のテンソル幅が一致しない
    #[error("export shape mismatch: '{producer}' has width {producer_width} but '{consumer}' expects {consumer_width}")]
    ExportShapeMismatch {
        producer: String,
        consumer: String,
        producer_width: usize,
        consumer_width: usize,
    },

    #[error("invalid model bundle: {0}")]
    Bundle(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("failed to encode ONNX model: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("failed to decode ONNX model: {0}")]
    Decode(#[from] prost::DecodeError),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn image(path: impl Into<PathBuf>, source: image::ImageError) -> Self {
        Self::Image {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

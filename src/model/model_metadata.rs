//! モデルバンドルのメタデータ
//!
//! tar.gz バンドル内の `metadata.json` として保存され、読み込み時に
//! フォーマットバージョン・アルゴリズム・入出力次元の検証に使われます。

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// 現在のバンドルフォーマットバージョン
pub const FORMAT_VERSION: u32 = 1;

/// バンドルに格納されたアルゴリズム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// 主成分分析（次元削減）
    Pca,
    /// サポートベクター分類器
    Svc,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::Pca => write!(f, "pca"),
            Algorithm::Svc => write!(f, "svc"),
        }
    }
}

/// バンドルメタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub format_version: u32,
    pub algorithm: Algorithm,
    /// 入力次元
    pub input_dim: usize,
    /// 出力次元（PCAは主成分数、SVMは1）
    pub output_dim: usize,
    /// 作成時刻（RFC3339形式）
    pub created_at: String,
    /// 作成したクレートのバージョン
    #[serde(default)]
    pub producer_version: String,
    /// 任意の補足情報（学習件数、収束状況など）
    #[serde(default)]
    pub notes: BTreeMap<String, String>,
}

impl BundleMetadata {
    /// 現在時刻で新しいメタデータを作成
    pub fn new(algorithm: Algorithm, input_dim: usize, output_dim: usize) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            algorithm,
            input_dim,
            output_dim,
            created_at: chrono::Local::now().to_rfc3339(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
            notes: BTreeMap::new(),
        }
    }

    /// 補足情報を追加
    pub fn with_note(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.notes.insert(key.into(), value.to_string());
        self
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_roundtrip() {
        let metadata = BundleMetadata::new(Algorithm::Pca, 7500, 150).with_note("samples", 42);
        let json = metadata.to_json_string().unwrap();
        assert!(json.contains("\"algorithm\": \"pca\""));
        let parsed = BundleMetadata::from_json_string(&json).unwrap();
        assert_eq!(parsed, metadata);
        assert_eq!(parsed.notes["samples"], "42");
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let json = r#"{"format_version":1,"algorithm":"random_forest","input_dim":1,"output_dim":1,"created_at":""}"#;
        assert!(BundleMetadata::from_json_string(json).is_err());
    }
}

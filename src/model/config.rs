//! パイプライン設定管理モジュール
//!
//! 前処理・データセット・PCA・SVM・成果物パスなどをJSON形式で保存・読み込みします。
//! すべての項目にデフォルト値があるため、設定ファイルは部分的な記述でも構いません。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 切り出し領域（元画像のピクセル座標）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// 画像前処理設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessSettings {
    /// 録画そのままのフレーム幅。この解像度の画像のみ切り出しを行う
    pub raw_width: u32,
    /// 録画そのままのフレーム高さ
    pub raw_height: u32,
    /// キル表示が出る固定位置
    pub crop: CropRegion,
    /// リサイズ後の幅
    pub target_width: u32,
    /// リサイズ後の高さ
    pub target_height: u32,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            raw_width: 1920,
            raw_height: 1080,
            crop: CropRegion {
                x: 860,
                y: 750,
                width: 200,
                height: 200,
            },
            target_width: 50,
            target_height: 50,
        }
    }
}

impl PreprocessSettings {
    /// 特徴ベクトル長 (幅 × 高さ × RGB)
    pub fn feature_len(&self) -> usize {
        self.target_width as usize * self.target_height as usize * 3
    }
}

/// データセット設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetSettings {
    /// データセットのルートディレクトリ
    pub root: PathBuf,
    /// カテゴリディレクトリ名（インデックス0 = イベントなし, 1 = イベントあり）
    pub categories: [String; 2],
    /// 監査で誤判定された画像の退避先
    pub wrong_dir: PathBuf,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("kill-data"),
            categories: ["no_kill".to_string(), "kill".to_string()],
            wrong_dir: PathBuf::from("kill-data/wrong"),
        }
    }
}

/// 次元削減（PCA）設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReducerSettings {
    /// PCAを使用するか
    pub enabled: bool,
    /// 主成分数
    pub n_components: usize,
    /// ランダム化部分空間反復の回数
    pub power_iterations: usize,
    /// 乱数シード
    pub seed: u64,
}

impl Default for ReducerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            n_components: 150,
            power_iterations: 4,
            seed: 42,
        }
    }
}

/// カーネルの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelChoice {
    Linear,
    Rbf,
}

/// クラス重み付け
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassWeight {
    /// クラス頻度に反比例した重み
    Balanced,
    /// 全クラス同一
    Uniform,
}

/// SVM設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    pub kernel: KernelChoice,
    /// RBFのgamma。未指定なら 1 / (特徴数 × 分散)
    pub gamma: Option<f64>,
    /// ソフトマージンのペナルティ
    pub c: f64,
    /// KKT条件違反の許容値
    pub tol: f64,
    /// SMOの最大反復回数
    pub max_iter: usize,
    pub class_weight: ClassWeight,
    /// カーネル行キャッシュの行数
    pub cache_rows: usize,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            kernel: KernelChoice::Rbf,
            gamma: None,
            c: 1.0,
            tol: 1e-6,
            max_iter: 1_000_000,
            class_weight: ClassWeight::Balanced,
            cache_rows: 2048,
        }
    }
}

/// 学習設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// 学習データの割合
    pub train_ratio: f32,
    /// 分割用のランダムシード
    pub seed: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            train_ratio: 0.9,
            seed: 42,
        }
    }
}

/// ベンチマーク設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    /// ウォームアップ推論回数（計測しない）
    pub warmup: usize,
    /// 計測する推論回数
    pub samples: usize,
    /// 読み込むデータセット行数の上限
    pub max_rows: Option<usize>,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            warmup: 10,
            samples: 1000,
            max_rows: None,
        }
    }
}

/// フレーム列からのイベント検出設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectSettings {
    /// 解析フレームレート (fps)
    pub rate: f64,
    /// イベントとみなす連続検出フレーム数
    pub required_detections: usize,
}

impl Default for DetectSettings {
    fn default() -> Self {
        Self {
            rate: 6.0,
            required_detections: 1,
        }
    }
}

/// 成果物のパス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    pub reducer_path: PathBuf,
    pub classifier_path: PathBuf,
    pub onnx_path: PathBuf,
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            reducer_path: PathBuf::from("pca.tar.gz"),
            classifier_path: PathBuf::from("svm.tar.gz"),
            onnx_path: PathBuf::from("model.onnx"),
        }
    }
}

/// パイプライン設定
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub preprocess: PreprocessSettings,
    pub dataset: DatasetSettings,
    pub reducer: ReducerSettings,
    pub classifier: ClassifierSettings,
    pub training: TrainingSettings,
    pub benchmark: BenchmarkSettings,
    pub detect: DetectSettings,
    pub artifacts: ArtifactSettings,
}

impl PipelineConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// 指定パス（未指定ならデフォルトパス）から読み込む。存在しない・壊れている場合はデフォルト設定
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            match Self::load(&path) {
                Ok(config) => {
                    log::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    log::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            log::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 設定情報をログに出力
    pub fn display(&self) {
        log::info!("=== パイプライン設定 ===");
        log::info!(
            "前処理: 元解像度 {}x{}, 切り出し ({}, {}) {}x{}, 出力 {}x{}",
            self.preprocess.raw_width,
            self.preprocess.raw_height,
            self.preprocess.crop.x,
            self.preprocess.crop.y,
            self.preprocess.crop.width,
            self.preprocess.crop.height,
            self.preprocess.target_width,
            self.preprocess.target_height
        );
        log::info!(
            "データセット: {} [{}]",
            self.dataset.root.display(),
            self.dataset.categories.join(", ")
        );
        if self.reducer.enabled {
            log::info!("PCA: {} 成分", self.reducer.n_components);
        } else {
            log::info!("PCA: 無効");
        }
        log::info!(
            "SVM: {:?}, C={}, tol={}, 最大反復={}, 重み={:?}",
            self.classifier.kernel,
            self.classifier.c,
            self.classifier.tol,
            self.classifier.max_iter,
            self.classifier.class_weight
        );
        log::info!(
            "成果物: {}, {}, {}",
            self.artifacts.reducer_path.display(),
            self.artifacts.classifier_path.display(),
            self.artifacts.onnx_path.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.preprocess.feature_len(), 50 * 50 * 3);
        assert_eq!(config.reducer.n_components, 150);
        assert_eq!(config.dataset.categories, ["no_kill".to_string(), "kill".to_string()]);
        assert_eq!(config.classifier.class_weight, ClassWeight::Balanced);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = PipelineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{ "reducer": { "n_components": 20 }, "classifier": { "kernel": "linear" } }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.reducer.n_components, 20);
        assert!(config.reducer.enabled);
        assert_eq!(config.classifier.kernel, KernelChoice::Linear);
        assert_eq!(config.training.train_ratio, 0.9);
    }

    #[test]
    fn test_load_or_default_on_broken_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        let config = PipelineConfig::load_or_default(Some(&path));
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = PipelineConfig::default();
        config.benchmark.samples = 5;
        config.save(&path).unwrap();
        assert_eq!(PipelineConfig::load(&path).unwrap(), config);
    }
}

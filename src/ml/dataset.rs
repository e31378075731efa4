//! 学習データセットの読み込みと分割
//!
//! ルートディレクトリ直下の2つのカテゴリディレクトリ（0 = イベントなし, 1 = イベントあり）を走査し、
//! 全画像を前処理して特徴行列とラベル列を作ります。
//! 形状が一致しない画像は読み込みレポートに記録してスキップします。

use std::path::{Path, PathBuf};

use ndarray::{Array2, ArrayView1, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::error::{PipelineError, Result};
use crate::model::config::DatasetSettings;
use crate::preprocess::Preprocessor;
use crate::types::Label;

/// 読み込み対象の拡張子
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// スキップされたサンプル
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedSample {
    pub path: PathBuf,
    pub reason: String,
}

/// 読み込み結果のレポート
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    pub dropped: Vec<DroppedSample>,
}

impl LoadReport {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }
}

/// 特徴行列・ラベル・元画像パスの組
///
/// 行数・ラベル数・パス数は常に一致します。
#[derive(Debug, Clone)]
pub struct Dataset {
    features: Array2<f32>,
    labels: Vec<Label>,
    paths: Vec<PathBuf>,
}

impl Dataset {
    /// 特徴行列とラベルからデータセットを作成
    pub fn from_parts(features: Array2<f32>, labels: Vec<Label>, paths: Vec<PathBuf>) -> Result<Self> {
        if features.nrows() != labels.len() {
            return Err(PipelineError::DimensionMismatch {
                expected: features.nrows(),
                actual: labels.len(),
            });
        }
        if paths.len() != labels.len() {
            return Err(PipelineError::DimensionMismatch {
                expected: labels.len(),
                actual: paths.len(),
            });
        }
        Ok(Self {
            features,
            labels,
            paths,
        })
    }

    /// ディレクトリから学習データを読み込む
    ///
    /// カテゴリ0の全画像、カテゴリ1の全画像の順に並びます（各カテゴリ内はファイル名順）。
    pub fn load(
        root: &Path,
        settings: &DatasetSettings,
        preprocessor: &Preprocessor,
    ) -> Result<(Self, LoadReport)> {
        let width = preprocessor.feature_len();
        let mut data = Vec::new();
        let mut labels = Vec::new();
        let mut paths = Vec::new();
        let mut report = LoadReport::default();

        for (label, category) in Label::ALL.iter().zip(settings.categories.iter()) {
            let class_dir = root.join(category);
            let files = list_images(&class_dir)?;
            log::info!("カテゴリ '{}' ({}): {} 枚", category, label, files.len());

            for path in files {
                match preprocessor.preprocess(&path) {
                    Ok(values) => {
                        data.extend_from_slice(&values);
                        labels.push(*label);
                        paths.push(path);
                    }
                    Err(PipelineError::ShapeMismatch { expected, actual, .. }) => {
                        log::warn!(
                            "形状不一致のためスキップ: {} (期待: {}, 実際: {})",
                            path.display(),
                            expected,
                            actual
                        );
                        report.dropped.push(DroppedSample {
                            reason: format!("expected {} values, got {}", expected, actual),
                            path,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let features = Array2::from_shape_vec((labels.len(), width), data).map_err(|_| {
            PipelineError::DimensionMismatch {
                expected: width,
                actual: 0,
            }
        })?;

        let dataset = Self::from_parts(features, labels, paths)?;
        let [negatives, positives] = dataset.class_counts();
        log::info!(
            "データセット読み込み完了: {} 件 (イベントなし {}, イベントあり {}, スキップ {})",
            dataset.len(),
            negatives,
            positives,
            report.dropped_count()
        );
        Ok((dataset, report))
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// 特徴ベクトル長
    pub fn width(&self) -> usize {
        self.features.ncols()
    }

    pub fn row(&self, index: usize) -> ArrayView1<'_, f32> {
        self.features.row(index)
    }

    /// クラスごとの件数 [イベントなし, イベントあり]
    pub fn class_counts(&self) -> [usize; 2] {
        let mut counts = [0usize; 2];
        for label in &self.labels {
            counts[label.index()] += 1;
        }
        counts
    }

    /// 先頭 `n` 件に制限したデータセット
    pub fn truncate(&self, n: usize) -> Self {
        let indices: Vec<usize> = (0..self.len().min(n)).collect();
        self.select(&indices)
    }

    /// 学習用と検証用に分割（シード付きシャッフル、層化なし）
    pub fn split(&self, train_ratio: f32, seed: u64) -> (Self, Self) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let ratio = train_ratio.clamp(0.0, 1.0);
        let train_len = (self.len() as f32 * ratio) as usize;
        let (train, test) = indices.split_at(train_len);
        (self.select(train), self.select(test))
    }

    fn select(&self, indices: &[usize]) -> Self {
        let features = if indices.is_empty() {
            Array2::zeros((0, self.width()))
        } else {
            self.features.select(Axis(0), indices)
        };
        Self {
            features,
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            paths: indices.iter().map(|&i| self.paths[i].clone()).collect(),
        }
    }
}

/// ディレクトリ内の画像ファイルをファイル名順に列挙
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::io(dir, e))?.path();
        if path.is_file() && has_image_extension(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{CropRegion, PreprocessSettings};
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(PreprocessSettings {
            raw_width: 64,
            raw_height: 48,
            crop: CropRegion {
                x: 0,
                y: 0,
                width: 16,
                height: 16,
            },
            target_width: 4,
            target_height: 4,
        })
        .unwrap()
    }

    fn settings() -> DatasetSettings {
        DatasetSettings {
            categories: ["neg".to_string(), "pos".to_string()],
            ..DatasetSettings::default()
        }
    }

    fn write_rgb(path: &Path, value: u8) {
        RgbImage::from_pixel(4, 4, Rgb([value, value, value])).save(path).unwrap();
    }

    #[test]
    fn test_load_drops_shape_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        let neg = dir.path().join("neg");
        let pos = dir.path().join("pos");
        std::fs::create_dir_all(&neg).unwrap();
        std::fs::create_dir_all(&pos).unwrap();

        write_rgb(&neg.join("a.png"), 10);
        write_rgb(&neg.join("b.png"), 20);
        GrayImage::from_pixel(4, 4, Luma([5])).save(neg.join("c.png")).unwrap();
        write_rgb(&pos.join("d.png"), 200);
        GrayImage::from_pixel(4, 4, Luma([9])).save(pos.join("e.png")).unwrap();
        std::fs::write(pos.join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir_all(dir.path().join("wrong")).unwrap();

        let (dataset, report) = Dataset::load(dir.path(), &settings(), &preprocessor()).unwrap();

        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.features().nrows(), dataset.labels().len());
        assert_eq!(dataset.width(), 4 * 4 * 3);
        assert_eq!(report.dropped_count(), 2);
        assert_eq!(dataset.labels(), &[Label::NoEvent, Label::NoEvent, Label::Event]);
        assert_eq!(dataset.class_counts(), [2, 1]);
    }

    #[test]
    fn test_missing_category_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("neg")).unwrap();
        let err = Dataset::load(dir.path(), &settings(), &preprocessor()).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn test_split_is_seeded_and_complete() {
        let features = Array2::from_shape_fn((20, 3), |(i, j)| (i * 3 + j) as f32);
        let labels = (0..20)
            .map(|i| if i % 2 == 0 { Label::NoEvent } else { Label::Event })
            .collect();
        let paths = (0..20).map(|i| PathBuf::from(format!("{i}.png"))).collect();
        let dataset = Dataset::from_parts(features, labels, paths).unwrap();

        let (train, test) = dataset.split(0.9, 42);
        let (train2, _) = dataset.split(0.9, 42);
        assert_eq!(train.len(), 18);
        assert_eq!(test.len(), 2);
        assert_eq!(train.paths(), train2.paths());

        let mut all: Vec<_> = train.paths().iter().chain(test.paths()).cloned().collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[test]
    fn test_from_parts_rejects_length_mismatch() {
        let features = Array2::<f32>::zeros((3, 2));
        let err = Dataset::from_parts(features, vec![Label::Event], vec![PathBuf::new()]).unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_truncate() {
        let features = Array2::<f32>::zeros((5, 2));
        let labels = vec![Label::Event; 5];
        let paths = vec![PathBuf::new(); 5];
        let dataset = Dataset::from_parts(features, labels, paths).unwrap();
        assert_eq!(dataset.truncate(3).len(), 3);
        assert_eq!(dataset.truncate(10).len(), 5);
    }
}

//! 推論パイプライン（前処理 → PCA → SVM）

use std::path::Path;

use ndarray::{Array2, ArrayView1};

use crate::error::{PipelineError, Result};
use crate::ml::pca::Pca;
use crate::ml::svm::Svm;
use crate::model::config::PipelineConfig;
use crate::model::model_storage::load_model;
use crate::preprocess::Preprocessor;
use crate::types::Label;

/// 学習済みモデル一式
#[derive(Debug, Clone)]
pub struct Pipeline {
    preprocessor: Preprocessor,
    reducer: Option<Pca>,
    classifier: Svm,
}

impl Pipeline {
    /// 各段の入出力次元を検証して組み立てる
    pub fn new(preprocessor: Preprocessor, reducer: Option<Pca>, classifier: Svm) -> Result<Self> {
        let feature_len = preprocessor.feature_len();
        let classifier_input = match &reducer {
            Some(pca) => {
                if pca.input_dim() != feature_len {
                    return Err(PipelineError::DimensionMismatch {
                        expected: feature_len,
                        actual: pca.input_dim(),
                    });
                }
                pca.output_dim()
            }
            None => feature_len,
        };
        if classifier.n_features() != classifier_input {
            return Err(PipelineError::DimensionMismatch {
                expected: classifier_input,
                actual: classifier.n_features(),
            });
        }
        Ok(Self {
            preprocessor,
            reducer,
            classifier,
        })
    }

    /// 設定の成果物パスからバンドルを読み込む
    ///
    /// PCAが無効な設定ではPCAバンドルを読みません。
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let preprocessor = Preprocessor::new(config.preprocess.clone())?;
        let reducer = if config.reducer.enabled {
            let (metadata, pca) = load_model::<Pca>(&config.artifacts.reducer_path)?;
            log::info!(
                "PCAを読み込みました: {} ({} -> {})",
                config.artifacts.reducer_path.display(),
                metadata.input_dim,
                metadata.output_dim
            );
            Some(pca)
        } else {
            None
        };
        let (_, classifier) = load_model::<Svm>(&config.artifacts.classifier_path)?;
        log::info!(
            "SVMを読み込みました: {} (サポートベクター {})",
            config.artifacts.classifier_path.display(),
            classifier.support_vectors().nrows()
        );
        Self::new(preprocessor, reducer, classifier)
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    pub fn reducer(&self) -> Option<&Pca> {
        self.reducer.as_ref()
    }

    pub fn classifier(&self) -> &Svm {
        &self.classifier
    }

    /// 前処理後の特徴ベクトル長
    pub fn input_dim(&self) -> usize {
        self.preprocessor.feature_len()
    }

    /// 特徴行列をSVM入力空間へ変換（PCA無効時はそのまま）
    pub fn reduce(&self, features: &Array2<f32>) -> Result<Array2<f32>> {
        match &self.reducer {
            Some(pca) => pca.transform(features),
            None => Ok(features.clone()),
        }
    }

    /// 特徴ベクトル1本を分類
    pub fn predict_features(&self, features: ArrayView1<'_, f32>) -> Result<Label> {
        match &self.reducer {
            Some(pca) => {
                let reduced = pca.transform_row(features)?;
                self.classifier.predict_row(reduced.view())
            }
            None => self.classifier.predict_row(features),
        }
    }

    /// 特徴行列の各行を分類
    pub fn predict(&self, features: &Array2<f32>) -> Result<Vec<Label>> {
        self.classifier.predict(&self.reduce(features)?)
    }

    /// SVM入力空間の1行を分類（ベンチマーク用）
    pub fn predict_reduced(&self, reduced: ArrayView1<'_, f32>) -> Result<Label> {
        self.classifier.predict_row(reduced)
    }

    /// 画像ファイルを分類
    pub fn classify_image(&self, path: &Path) -> Result<Label> {
        let values = self.preprocessor.preprocess(path)?;
        self.predict_features(ArrayView1::from(&values[..]))
    }

    /// RGB8の生フレームを分類
    pub fn classify_frame(&self, raw: &[u8], width: u32, height: u32) -> Result<Label> {
        let values = self.preprocessor.preprocess_rgb_frame(raw, width, height)?;
        self.predict_features(ArrayView1::from(&values[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{ClassifierSettings, CropRegion, KernelChoice, PreprocessSettings, ReducerSettings};
    use image::{Rgb, RgbImage};

    fn preprocessor() -> Preprocessor {
        Preprocessor::new(PreprocessSettings {
            raw_width: 32,
            raw_height: 32,
            crop: CropRegion {
                x: 0,
                y: 0,
                width: 8,
                height: 8,
            },
            target_width: 2,
            target_height: 2,
        })
        .unwrap()
    }

    /// 暗い画像 = イベントなし、明るい画像 = イベントあり
    fn training_data() -> (Array2<f32>, Vec<Label>) {
        let x = Array2::from_shape_fn((20, 12), |(i, j)| {
            let base = if i < 10 { 0.1 } else { 0.9 };
            base + ((i * 5 + j) % 7) as f32 * 0.01
        });
        let labels = (0..20)
            .map(|i| if i < 10 { Label::NoEvent } else { Label::Event })
            .collect();
        (x, labels)
    }

    fn fitted() -> Pipeline {
        let (x, labels) = training_data();
        let pca = Pca::fit(
            &x,
            &ReducerSettings {
                n_components: 3,
                ..ReducerSettings::default()
            },
        )
        .unwrap();
        let reduced = pca.transform(&x).unwrap();
        let svm = Svm::fit(&reduced, &labels, &ClassifierSettings::default()).unwrap();
        Pipeline::new(preprocessor(), Some(pca), svm).unwrap()
    }

    #[test]
    fn test_classify_image_and_frame() {
        let pipeline = fitted();
        let dir = tempfile::tempdir().unwrap();
        let bright = dir.path().join("bright.png");
        RgbImage::from_pixel(4, 4, Rgb([235, 235, 235])).save(&bright).unwrap();

        assert_eq!(pipeline.classify_image(&bright).unwrap(), Label::Event);
        assert_eq!(pipeline.classify_frame(&[20u8; 4 * 4 * 3], 4, 4).unwrap(), Label::NoEvent);
    }

    #[test]
    fn test_batch_and_single_predictions_agree() {
        let pipeline = fitted();
        let (x, labels) = training_data();
        let batch = pipeline.predict(&x).unwrap();
        assert_eq!(batch, labels);
        for (row, expected) in x.rows().into_iter().zip(batch.iter()) {
            assert_eq!(pipeline.predict_features(row).unwrap(), *expected);
        }
    }

    #[test]
    fn test_mismatched_stages_are_rejected() {
        let (x, labels) = training_data();
        let svm = Svm::fit(
            &x.slice(ndarray::s![.., ..5]).to_owned(),
            &labels,
            &ClassifierSettings {
                kernel: KernelChoice::Linear,
                ..ClassifierSettings::default()
            },
        )
        .unwrap();
        let err = Pipeline::new(preprocessor(), None, svm).unwrap_err();
        assert!(matches!(err, PipelineError::DimensionMismatch { expected: 12, actual: 5 }));
    }
}

//! 主成分分析（PCA）による次元削減
//!
//! 学習データのみから平均と主成分を推定し、以後は同じパラメータで
//! 学習・ベンチマーク・エクスポート・推論のすべてに使用します。
//!
//! 推定はシード付きのランダム化部分空間反復で行い、射影後の小さな行列を
//! Jacobi法で固有値分解します。主成分の符号は絶対値最大の係数が正になるよう揃えます。

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::ml::linalg::{orthonormalize_columns, symmetric_eigen};
use crate::model::config::ReducerSettings;

/// ランダム化部分空間反復の追加次元
const OVERSAMPLING: usize = 10;

/// 学習済みPCAパラメータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pca {
    /// 特徴ごとの平均 (d)
    mean: Array1<f32>,
    /// 主成分 (k × d)、各行が正規直交
    components: Array2<f32>,
    /// 各主成分の分散 (k)
    explained_variance: Array1<f32>,
}

impl Pca {
    /// 学習データからPCAを推定
    ///
    /// 主成分数は `min(サンプル数, 特徴数)` で打ち切ります。
    pub fn fit(x: &Array2<f32>, settings: &ReducerSettings) -> Result<Self> {
        let (n, d) = x.dim();
        if n == 0 || d == 0 {
            return Err(PipelineError::EmptyDataset);
        }
        if settings.n_components == 0 {
            return Err(PipelineError::InvalidArgument(
                "n_components must be positive".to_string(),
            ));
        }

        let k = settings.n_components.min(n).min(d);
        if k < settings.n_components {
            log::warn!(
                "主成分数を {} から {} に制限します (サンプル数 {}, 特徴数 {})",
                settings.n_components,
                k,
                n,
                d
            );
        }

        let mean = x.mean_axis(Axis(0)).ok_or(PipelineError::EmptyDataset)?;
        let centered = (x - &mean).mapv(f64::from);

        let l = (k + OVERSAMPLING).min(n).min(d);
        let mut rng = rand::rngs::StdRng::seed_from_u64(settings.seed);
        let omega = Array2::from_shape_fn((d, l), |_| rng.gen_range(-1.0..1.0));

        // 値域の近似: Q (n × l)
        let mut q = centered.dot(&omega);
        orthonormalize_columns(&mut q);
        for _ in 0..settings.power_iterations {
            let mut z = centered.t().dot(&q);
            orthonormalize_columns(&mut z);
            q = centered.dot(&z);
            orthonormalize_columns(&mut q);
        }

        // B = Qᵀ X (l × d) の右特異ベクトルが主成分
        let b = q.t().dot(&centered);
        let gram = b.dot(&b.t());
        let (eigenvalues, eigenvectors) = symmetric_eigen(&gram);

        let denom = if n > 1 { (n - 1) as f64 } else { 1.0 };
        let mut components = Array2::<f32>::zeros((k, d));
        let mut explained_variance = Array1::<f32>::zeros(k);
        for i in 0..k {
            let lambda = eigenvalues[i].max(0.0);
            let sigma = lambda.sqrt();
            explained_variance[i] = (lambda / denom) as f32;
            if sigma <= 1e-12 {
                log::debug!("主成分 {} の特異値がほぼ0のためゼロベクトルとします", i);
                continue;
            }

            let mut v = b.t().dot(&eigenvectors.column(i)) / sigma;
            let pivot = v
                .iter()
                .copied()
                .max_by(|a, b| a.abs().total_cmp(&b.abs()))
                .unwrap_or(0.0);
            if pivot < 0.0 {
                v.mapv_inplace(|x| -x);
            }
            components.row_mut(i).assign(&v.mapv(|x| x as f32));
        }

        log::debug!(
            "PCA推定完了: {} -> {} 次元, 分散上位 {:?}",
            d,
            k,
            explained_variance.iter().take(3).collect::<Vec<_>>()
        );

        Ok(Self {
            mean,
            components,
            explained_variance,
        })
    }

    /// 保存済みパラメータから組み立てる
    pub fn from_parts(
        mean: Array1<f32>,
        components: Array2<f32>,
        explained_variance: Array1<f32>,
    ) -> Result<Self> {
        let pca = Self {
            mean,
            components,
            explained_variance,
        };
        pca.validate()?;
        Ok(pca)
    }

    /// 配列サイズの整合性を検証
    pub fn validate(&self) -> Result<()> {
        if self.components.ncols() != self.mean.len() {
            return Err(PipelineError::Bundle(format!(
                "PCA components have width {} but mean has {}",
                self.components.ncols(),
                self.mean.len()
            )));
        }
        if self.explained_variance.len() != self.components.nrows() {
            return Err(PipelineError::Bundle(format!(
                "PCA has {} components but {} variances",
                self.components.nrows(),
                self.explained_variance.len()
            )));
        }
        Ok(())
    }

    /// 入力次元
    pub fn input_dim(&self) -> usize {
        self.mean.len()
    }

    /// 出力次元（主成分数）
    pub fn output_dim(&self) -> usize {
        self.components.nrows()
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn components(&self) -> &Array2<f32> {
        &self.components
    }

    pub fn explained_variance(&self) -> &Array1<f32> {
        &self.explained_variance
    }

    /// 行列の各行を射影
    pub fn transform(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_width(x.ncols())?;
        Ok((x - &self.mean).dot(&self.components.t()))
    }

    /// 1サンプルを射影
    pub fn transform_row(&self, x: ArrayView1<'_, f32>) -> Result<Array1<f32>> {
        self.check_width(x.len())?;
        Ok(self.components.dot(&(&x - &self.mean)))
    }

    fn check_width(&self, width: usize) -> Result<()> {
        if width != self.input_dim() {
            return Err(PipelineError::DimensionMismatch {
                expected: self.input_dim(),
                actual: width,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn settings(n_components: usize) -> ReducerSettings {
        ReducerSettings {
            n_components,
            ..ReducerSettings::default()
        }
    }

    /// 2次元の直線上に並んだ点
    fn line_data() -> Array2<f32> {
        Array2::from_shape_fn((20, 2), |(i, j)| {
            let t = i as f32 - 10.0;
            if j == 0 {
                t * 2.0 + 1.0
            } else {
                t + 3.0
            }
        })
    }

    #[test]
    fn test_first_component_follows_main_direction() {
        let pca = Pca::fit(&line_data(), &settings(1)).unwrap();
        let c = pca.components().row(0);
        let norm = 5.0f32.sqrt();
        assert!((c[0] - 2.0 / norm).abs() < 1e-4);
        assert!((c[1] - 1.0 / norm).abs() < 1e-4);
        assert!((pca.mean()[0] - 0.0).abs() < 1e-5);
        assert!((pca.mean()[1] - 2.5).abs() < 1e-5);
    }

    #[test]
    fn test_components_are_orthonormal() {
        let x = Array2::from_shape_fn((30, 6), |(i, j)| ((i * 7 + j * 13) % 11) as f32 + (i * j) as f32 * 0.1);
        let pca = Pca::fit(&x, &settings(4)).unwrap();
        let gram = pca.components().dot(&pca.components().t());
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((gram[[i, j]] - expected).abs() < 1e-4, "gram[{i},{j}] = {}", gram[[i, j]]);
            }
        }
        let var = pca.explained_variance();
        assert!(var.windows(2).into_iter().all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_component_count_is_clipped() {
        let x = Array2::from_shape_fn((5, 8), |(i, j)| (i * j) as f32 + i as f32);
        let pca = Pca::fit(&x, &settings(150)).unwrap();
        assert_eq!(pca.output_dim(), 5);
        assert_eq!(pca.input_dim(), 8);
    }

    #[test]
    fn test_transform_is_deterministic_and_checks_width() {
        let x = line_data();
        let a = Pca::fit(&x, &settings(2)).unwrap();
        let b = Pca::fit(&x, &settings(2)).unwrap();
        assert_eq!(a, b);

        let projected = a.transform(&x).unwrap();
        assert_eq!(projected.dim(), (20, 2));
        let single = a.transform_row(x.row(3)).unwrap();
        for (p, q) in projected.row(3).iter().zip(single.iter()) {
            assert!((p - q).abs() < 1e-5);
        }

        let wrong = array![[1.0f32, 2.0, 3.0]];
        assert!(matches!(
            a.transform(&wrong),
            Err(PipelineError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }

    #[test]
    fn test_empty_input_is_error() {
        let x = Array2::<f32>::zeros((0, 4));
        assert!(matches!(Pca::fit(&x, &settings(2)), Err(PipelineError::EmptyDataset)));
    }
}

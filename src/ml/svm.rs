//! 二値サポートベクターマシン（C-SVC）
//!
//! 双対問題を SMO 法で解きます。作業集合は最大違反変数と、二次情報で目的関数の減少が最大になる相手を選び、
//! バイアスは自由サポートベクターの勾配平均から求めます。
//!
//! 決定関数: f(x) = Σ dual_coef_i · K(sv_i, x) + bias、f(x) > 0 ならイベントあり。

use ndarray::{Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::ml::kernel::{Kernel, KernelCache};
use crate::model::config::{ClassWeight, ClassifierSettings};
use crate::types::Label;

/// 二次係数が非正のときに使う下限
const TAU: f64 = 1e-12;

/// 学習の収束情報
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitInfo {
    pub iterations: usize,
    pub converged: bool,
}

/// 学習済みSVM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Svm {
    kernel: Kernel,
    /// サポートベクター (m × k)。イベントなしクラスが先
    support_vectors: Array2<f32>,
    /// α_i · y_i
    dual_coef: Array1<f64>,
    bias: f64,
    /// クラスごとのサポートベクター数 [イベントなし, イベントあり]
    n_support: [usize; 2],
    fit_info: FitInfo,
}

impl Svm {
    /// 学習データからSVMを学習
    pub fn fit(x: &Array2<f32>, labels: &[Label], settings: &ClassifierSettings) -> Result<Self> {
        let n = x.nrows();
        if n == 0 {
            return Err(PipelineError::EmptyDataset);
        }
        if labels.len() != n {
            return Err(PipelineError::DimensionMismatch {
                expected: n,
                actual: labels.len(),
            });
        }
        if !(settings.c > 0.0) || !(settings.tol > 0.0) {
            return Err(PipelineError::InvalidArgument(format!(
                "C and tol must be positive (C={}, tol={})",
                settings.c, settings.tol
            )));
        }

        let mut counts = [0usize; 2];
        for label in labels {
            counts[label.index()] += 1;
        }
        if let Some(only) = Label::ALL.iter().find(|l| counts[l.index()] == n) {
            return Err(PipelineError::SingleClass(*only));
        }

        let class_c: [f64; 2] = match settings.class_weight {
            ClassWeight::Balanced => [
                settings.c * n as f64 / (2.0 * counts[0] as f64),
                settings.c * n as f64 / (2.0 * counts[1] as f64),
            ],
            ClassWeight::Uniform => [settings.c, settings.c],
        };

        let kernel = Kernel::from_choice(settings.kernel, settings.gamma, x);
        log::info!(
            "SVM学習開始: {} 件 x {} 次元, カーネル {:?}, C = [{:.4}, {:.4}]",
            n,
            x.ncols(),
            kernel,
            class_c[0],
            class_c[1]
        );

        let y: Vec<f64> = labels.iter().map(|l| l.sign()).collect();
        let upper: Vec<f64> = labels.iter().map(|l| class_c[l.index()]).collect();
        let mut cache = KernelCache::new(kernel, x, settings.cache_rows);
        let mut solver = Solver {
            y: &y,
            upper: &upper,
            diag: cache.diagonal(),
            alpha: vec![0.0; n],
            grad: vec![-1.0; n],
        };

        let mut iterations = 0;
        let mut converged = false;
        while iterations < settings.max_iter {
            let Some((i, j)) = solver.select_working_set(&mut cache, settings.tol) else {
                converged = true;
                break;
            };
            let row_i = cache.row(i).to_vec();
            let row_j = cache.row(j).to_vec();
            solver.update_pair(i, j, &row_i, &row_j);
            iterations += 1;
        }

        if converged {
            log::info!("SMO収束: {} 反復", iterations);
        } else {
            log::warn!(
                "SMOが最大反復回数 {} に達しました。収束していない可能性があります",
                settings.max_iter
            );
        }

        let bias = -solver.rho();

        // イベントなしクラスのサポートベクターを先に並べる
        let mut support: Vec<usize> = Vec::new();
        let mut n_support = [0usize; 2];
        for label in Label::ALL {
            for (idx, l) in labels.iter().enumerate() {
                if *l == label && solver.alpha[idx] > 0.0 {
                    support.push(idx);
                    n_support[label.index()] += 1;
                }
            }
        }

        let support_vectors = if support.is_empty() {
            Array2::zeros((0, x.ncols()))
        } else {
            x.select(Axis(0), &support)
        };
        let dual_coef: Array1<f64> = support.iter().map(|&i| solver.alpha[i] * y[i]).collect();

        log::info!(
            "サポートベクター数: {} (イベントなし {}, イベントあり {}), bias = {:.6}",
            support.len(),
            n_support[0],
            n_support[1],
            bias
        );

        Ok(Self {
            kernel,
            support_vectors,
            dual_coef,
            bias,
            n_support,
            fit_info: FitInfo {
                iterations,
                converged,
            },
        })
    }

    /// 配列サイズの整合性を検証
    pub fn validate(&self) -> Result<()> {
        let m = self.support_vectors.nrows();
        if self.dual_coef.len() != m || self.n_support[0] + self.n_support[1] != m {
            return Err(PipelineError::Bundle(format!(
                "SVM has {} support vectors, {} coefficients and n_support {:?}",
                m,
                self.dual_coef.len(),
                self.n_support
            )));
        }
        if !self.bias.is_finite() {
            return Err(PipelineError::Bundle("SVM bias is not finite".to_string()));
        }
        Ok(())
    }

    pub fn kernel(&self) -> Kernel {
        self.kernel
    }

    pub fn support_vectors(&self) -> &Array2<f32> {
        &self.support_vectors
    }

    pub fn dual_coef(&self) -> &Array1<f64> {
        &self.dual_coef
    }

    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn n_support(&self) -> [usize; 2] {
        self.n_support
    }

    pub fn fit_info(&self) -> FitInfo {
        self.fit_info
    }

    /// 入力次元
    pub fn n_features(&self) -> usize {
        self.support_vectors.ncols()
    }

    /// 決定関数の値
    pub fn decision_function(&self, x: ArrayView1<'_, f32>) -> Result<f64> {
        if x.len() != self.n_features() {
            return Err(PipelineError::DimensionMismatch {
                expected: self.n_features(),
                actual: x.len(),
            });
        }
        let sum: f64 = self
            .support_vectors
            .rows()
            .into_iter()
            .zip(self.dual_coef.iter())
            .map(|(sv, coef)| coef * self.kernel.compute(sv, x))
            .sum();
        Ok(sum + self.bias)
    }

    /// 1サンプルを分類
    pub fn predict_row(&self, x: ArrayView1<'_, f32>) -> Result<Label> {
        let score = self.decision_function(x)?;
        Ok(if score > 0.0 { Label::Event } else { Label::NoEvent })
    }

    /// 各行を分類
    pub fn predict(&self, x: &Array2<f32>) -> Result<Vec<Label>> {
        x.rows().into_iter().map(|row| self.predict_row(row)).collect()
    }
}

/// SMOの作業状態
struct Solver<'a> {
    y: &'a [f64],
    upper: &'a [f64],
    diag: Vec<f64>,
    alpha: Vec<f64>,
    /// 目的関数の勾配 Qα - 1
    grad: Vec<f64>,
}

impl Solver<'_> {
    fn at_upper(&self, t: usize) -> bool {
        self.alpha[t] >= self.upper[t]
    }

    fn at_lower(&self, t: usize) -> bool {
        self.alpha[t] <= 0.0
    }

    /// 最大違反ペアを選ぶ。KKT条件を tol 以内で満たしていれば `None`
    fn select_working_set(&self, cache: &mut KernelCache<'_>, tol: f64) -> Option<(usize, usize)> {
        let n = self.alpha.len();
        let mut g_max = f64::NEG_INFINITY;
        let mut i_best = None;
        for t in 0..n {
            let candidate = if self.y[t] > 0.0 {
                (!self.at_upper(t)).then(|| -self.grad[t])
            } else {
                (!self.at_lower(t)).then(|| self.grad[t])
            };
            if let Some(value) = candidate {
                if value >= g_max {
                    g_max = value;
                    i_best = Some(t);
                }
            }
        }
        let i = i_best?;
        let row_i = cache.row(i);

        let mut g_max2 = f64::NEG_INFINITY;
        let mut j_best = None;
        let mut obj_diff_min = f64::INFINITY;
        for t in 0..n {
            let (eligible, violation, grad_diff) = if self.y[t] > 0.0 {
                (!self.at_lower(t), self.grad[t], g_max + self.grad[t])
            } else {
                (!self.at_upper(t), -self.grad[t], g_max - self.grad[t])
            };
            if !eligible {
                continue;
            }
            g_max2 = g_max2.max(violation);
            if grad_diff > 0.0 {
                let quad = self.diag[i] + self.diag[t] - 2.0 * row_i[t];
                let obj_diff = -(grad_diff * grad_diff) / if quad > 0.0 { quad } else { TAU };
                if obj_diff <= obj_diff_min {
                    obj_diff_min = obj_diff;
                    j_best = Some(t);
                }
            }
        }

        if g_max + g_max2 < tol {
            return None;
        }
        j_best.map(|j| (i, j))
    }

    /// 2変数の部分問題を解いて α と勾配を更新
    fn update_pair(&mut self, i: usize, j: usize, row_i: &[f64], row_j: &[f64]) {
        let (c_i, c_j) = (self.upper[i], self.upper[j]);
        let (old_i, old_j) = (self.alpha[i], self.alpha[j]);
        let mut quad = self.diag[i] + self.diag[j] - 2.0 * row_i[j];
        if quad <= 0.0 {
            quad = TAU;
        }

        let (mut a_i, mut a_j) = (old_i, old_j);
        if self.y[i] != self.y[j] {
            let delta = (-self.grad[i] - self.grad[j]) / quad;
            let diff = a_i - a_j;
            a_i += delta;
            a_j += delta;
            if diff > 0.0 {
                if a_j < 0.0 {
                    a_j = 0.0;
                    a_i = diff;
                }
            } else if a_i < 0.0 {
                a_i = 0.0;
                a_j = -diff;
            }
            if diff > c_i - c_j {
                if a_i > c_i {
                    a_i = c_i;
                    a_j = c_i - diff;
                }
            } else if a_j > c_j {
                a_j = c_j;
                a_i = c_j + diff;
            }
        } else {
            let delta = (self.grad[i] - self.grad[j]) / quad;
            let sum = a_i + a_j;
            a_i -= delta;
            a_j += delta;
            if sum > c_i {
                if a_i > c_i {
                    a_i = c_i;
                    a_j = sum - c_i;
                }
            } else if a_j < 0.0 {
                a_j = 0.0;
                a_i = sum;
            }
            if sum > c_j {
                if a_j > c_j {
                    a_j = c_j;
                    a_i = sum - c_j;
                }
            } else if a_i < 0.0 {
                a_i = 0.0;
                a_j = sum;
            }
        }

        self.alpha[i] = a_i;
        self.alpha[j] = a_j;
        let d_i = (a_i - old_i) * self.y[i];
        let d_j = (a_j - old_j) * self.y[j];
        for k in 0..self.grad.len() {
            self.grad[k] += self.y[k] * (row_i[k] * d_i + row_j[k] * d_j);
        }
    }

    /// 決定関数のオフセット ρ（bias = -ρ）
    fn rho(&self) -> f64 {
        let mut upper_bound = f64::INFINITY;
        let mut lower_bound = f64::NEG_INFINITY;
        let mut free_count = 0usize;
        let mut free_sum = 0.0;

        for t in 0..self.alpha.len() {
            let yg = self.y[t] * self.grad[t];
            if self.at_upper(t) {
                if self.y[t] < 0.0 {
                    upper_bound = upper_bound.min(yg);
                } else {
                    lower_bound = lower_bound.max(yg);
                }
            } else if self.at_lower(t) {
                if self.y[t] > 0.0 {
                    upper_bound = upper_bound.min(yg);
                } else {
                    lower_bound = lower_bound.max(yg);
                }
            } else {
                free_count += 1;
                free_sum += yg;
            }
        }

        if free_count > 0 {
            free_sum / free_count as f64
        } else {
            (upper_bound + lower_bound) / 2.0
        }
    }
}

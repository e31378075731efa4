//! SVMカーネルとカーネル行キャッシュ

use std::collections::{HashMap, VecDeque};

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::model::config::KernelChoice;

/// 学習済みカーネル（gamma確定済み）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Kernel {
    Linear,
    Rbf { gamma: f64 },
}

impl Kernel {
    /// 設定と学習データからカーネルを決定
    ///
    /// RBFでgamma未指定の場合は 1 / (特徴数 × 全要素の分散) を使います。
    pub fn from_choice(choice: KernelChoice, gamma: Option<f64>, x: &Array2<f32>) -> Self {
        match choice {
            KernelChoice::Linear => Kernel::Linear,
            KernelChoice::Rbf => Kernel::Rbf {
                gamma: gamma.unwrap_or_else(|| scale_gamma(x)),
            },
        }
    }

    /// 2ベクトル間のカーネル値
    pub fn compute(&self, a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> f64 {
        match *self {
            Kernel::Linear => f64::from(a.dot(&b)),
            Kernel::Rbf { gamma } => {
                let dist: f64 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| {
                        let d = f64::from(*x) - f64::from(*y);
                        d * d
                    })
                    .sum();
                (-gamma * dist).exp()
            }
        }
    }

    /// `x` の各行と `v` のカーネル値。`norms` は各行の二乗ノルム
    pub fn row_against(&self, x: &Array2<f32>, norms: &Array1<f32>, v: ArrayView1<'_, f32>) -> Vec<f64> {
        let dots = x.dot(&v);
        match *self {
            Kernel::Linear => dots.iter().map(|d| f64::from(*d)).collect(),
            Kernel::Rbf { gamma } => {
                let v_norm = f64::from(v.dot(&v));
                dots.iter()
                    .zip(norms.iter())
                    .map(|(d, n)| {
                        let dist = (f64::from(*n) + v_norm - 2.0 * f64::from(*d)).max(0.0);
                        (-gamma * dist).exp()
                    })
                    .collect()
            }
        }
    }

    /// ONNX SVMClassifier の kernel_type
    pub fn onnx_kernel_type(&self) -> &'static str {
        match self {
            Kernel::Linear => "LINEAR",
            Kernel::Rbf { .. } => "RBF",
        }
    }

    /// ONNX SVMClassifier の kernel_params [gamma, coef0, degree]
    pub fn onnx_kernel_params(&self) -> [f32; 3] {
        match *self {
            Kernel::Linear => [0.0, 0.0, 0.0],
            Kernel::Rbf { gamma } => [gamma as f32, 0.0, 0.0],
        }
    }
}

/// gamma = 1 / (特徴数 × 分散)。分散が0なら1
pub fn scale_gamma(x: &Array2<f32>) -> f64 {
    let count = x.len();
    if count == 0 {
        return 1.0;
    }
    let mean: f64 = x.iter().map(|v| f64::from(*v)).sum::<f64>() / count as f64;
    let var: f64 = x
        .iter()
        .map(|v| {
            let d = f64::from(*v) - mean;
            d * d
        })
        .sum::<f64>()
        / count as f64;
    if var > 0.0 {
        1.0 / (x.ncols() as f64 * var)
    } else {
        1.0
    }
}

/// 各行の二乗ノルム
pub fn squared_norms(x: &Array2<f32>) -> Array1<f32> {
    x.rows().into_iter().map(|r| r.dot(&r)).collect()
}

/// 学習中のカーネル行キャッシュ（最も長く使われていない行から破棄）
pub struct KernelCache<'a> {
    kernel: Kernel,
    x: &'a Array2<f32>,
    norms: Array1<f32>,
    rows: HashMap<usize, Vec<f64>>,
    order: VecDeque<usize>,
    capacity: usize,
}

impl<'a> KernelCache<'a> {
    pub fn new(kernel: Kernel, x: &'a Array2<f32>, capacity: usize) -> Self {
        Self {
            kernel,
            x,
            norms: squared_norms(x),
            rows: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    /// K(x_i, x_k) の対角成分
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.x.nrows())
            .map(|i| self.kernel.compute(self.x.row(i), self.x.row(i)))
            .collect()
    }

    /// i行目 K(x_i, ·) を取得（未計算なら計算してキャッシュ）
    pub fn row(&mut self, i: usize) -> &[f64] {
        if self.rows.contains_key(&i) {
            if let Some(pos) = self.order.iter().position(|&k| k == i) {
                self.order.remove(pos);
            }
        } else {
            if self.order.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.rows.remove(&evicted);
                }
            }
            let row = self.kernel.row_against(self.x, &self.norms, self.x.row(i));
            self.rows.insert(i, row);
        }
        self.order.push_back(i);
        &self.rows[&i]
    }
}

//! 分類性能の評価

use std::fmt;

use serde::Serialize;

use crate::types::Label;

/// クラスごとの指標
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// 分類レポート（正解率・クラス別指標・マクロ平均・重み付き平均）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub accuracy: f64,
    /// [イベントなし, イベントあり]
    pub per_class: [ClassMetrics; 2],
    pub macro_avg: ClassMetrics,
    pub weighted_avg: ClassMetrics,
    /// confusion[正解][予測]
    pub confusion: [[usize; 2]; 2],
}

impl ClassificationReport {
    /// 正解ラベルと予測ラベルから評価する
    ///
    /// 分母が0になる指標は0とします。
    pub fn evaluate(truth: &[Label], predicted: &[Label]) -> Self {
        let mut confusion = [[0usize; 2]; 2];
        for (t, p) in truth.iter().zip(predicted.iter()) {
            confusion[t.index()][p.index()] += 1;
        }
        let total: usize = confusion.iter().flatten().sum();
        let correct = confusion[0][0] + confusion[1][1];

        let mut per_class = [ClassMetrics::default(); 2];
        for (c, metrics) in per_class.iter_mut().enumerate() {
            let tp = confusion[c][c] as f64;
            let predicted_c = (confusion[0][c] + confusion[1][c]) as f64;
            let support = confusion[c][0] + confusion[c][1];
            let precision = ratio(tp, predicted_c);
            let recall = ratio(tp, support as f64);
            *metrics = ClassMetrics {
                precision,
                recall,
                f1: ratio(2.0 * precision * recall, precision + recall),
                support,
            };
        }

        let macro_avg = ClassMetrics {
            precision: (per_class[0].precision + per_class[1].precision) / 2.0,
            recall: (per_class[0].recall + per_class[1].recall) / 2.0,
            f1: (per_class[0].f1 + per_class[1].f1) / 2.0,
            support: total,
        };
        let weighted = |f: fn(&ClassMetrics) -> f64| {
            ratio(
                per_class.iter().map(|m| f(m) * m.support as f64).sum(),
                total as f64,
            )
        };
        let weighted_avg = ClassMetrics {
            precision: weighted(|m| m.precision),
            recall: weighted(|m| m.recall),
            f1: weighted(|m| m.f1),
            support: total,
        };

        Self {
            accuracy: ratio(correct as f64, total as f64),
            per_class,
            macro_avg,
            weighted_avg,
            confusion,
        }
    }

    /// 評価件数
    pub fn total(&self) -> usize {
        self.macro_avg.support
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>14} {:>10} {:>10} {:>10} {:>10}", "", "precision", "recall", "f1-score", "support")?;
        writeln!(f)?;
        for label in Label::ALL {
            let m = &self.per_class[label.index()];
            writeln!(
                f,
                "{:>14} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                label.index(),
                m.precision,
                m.recall,
                m.f1,
                m.support
            )?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>14} {:>10} {:>10} {:>10.2} {:>10}",
            "accuracy",
            "",
            "",
            self.accuracy,
            self.total()
        )?;
        for (name, m) in [("macro avg", &self.macro_avg), ("weighted avg", &self.weighted_avg)] {
            writeln!(
                f,
                "{:>14} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                name, m.precision, m.recall, m.f1, m.support
            )?;
        }
        Ok(())
    }
}

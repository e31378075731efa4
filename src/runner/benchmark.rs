//! 推論レイテンシの計測

use std::fmt;
use std::time::Instant;

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::ml::dataset::Dataset;
use crate::ml::pipeline::Pipeline;
use crate::model::config::BenchmarkSettings;

/// 計測結果（ミリ秒）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub samples: usize,
    pub mean_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl fmt::Display for BenchmarkReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Average inference time: {:.2}ms (min {:.2}ms, max {:.2}ms, {} samples)",
            self.mean_ms, self.min_ms, self.max_ms, self.samples
        )
    }
}

/// 1件ずつの推論時間を計測する
///
/// PCA変換は計測前にまとめて行い、SVMの予測のみを計測します。
/// 先頭 `warmup` 件の推論は結果に含めません。
pub fn run_benchmark(pipeline: &Pipeline, dataset: &Dataset, settings: &BenchmarkSettings) -> Result<BenchmarkReport> {
    if dataset.is_empty() {
        return Err(PipelineError::EmptyDataset);
    }
    let reduced = pipeline.reduce(dataset.features())?;
    let count = settings.samples.min(reduced.nrows());
    if count == 0 {
        return Err(PipelineError::InvalidArgument("benchmark sample count must be positive".to_string()));
    }

    for row in reduced.rows().into_iter().take(settings.warmup) {
        pipeline.predict_reduced(row)?;
    }

    log::info!("ベンチマーク開始: {} 件", count);
    let mut times = Vec::with_capacity(count);
    for row in reduced.rows().into_iter().take(count) {
        let start = Instant::now();
        pipeline.predict_reduced(row)?;
        times.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    let mean_ms = times.iter().sum::<f64>() / times.len() as f64;
    let min_ms = times.iter().copied().fold(f64::INFINITY, f64::min);
    let max_ms = times.iter().copied().fold(0.0, f64::max);
    Ok(BenchmarkReport {
        samples: times.len(),
        mean_ms,
        min_ms,
        max_ms,
    })
}

//! CLIサブコマンドの実装
//!
//! ライブラリの各処理を設定に従って組み合わせます。エラーは文脈付きの `anyhow` で返します。

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::detect::{detect_in_directory, format_timestamp};
use crate::export::{decode_model, export_to_file};
use crate::ml::{ClassificationReport, Dataset, Pca, Pipeline, Svm};
use crate::model::config::PipelineConfig;
use crate::model::model_metadata::{Algorithm, BundleMetadata};
use crate::model::model_storage::{describe_metadata, load_metadata, load_model, save_model};
use crate::preprocess::Preprocessor;
use crate::runner::{run_audit, run_benchmark, AuditReport, BenchmarkReport};
use crate::types::Label;

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub train_samples: usize,
    /// 検証データが無い場合は `None`
    pub report: Option<ClassificationReport>,
    pub reducer_path: Option<PathBuf>,
    pub classifier_path: PathBuf,
    pub converged: bool,
}

/// データセットを読み込み、PCAとSVMを学習してバンドルを保存する
pub fn train(config: &PipelineConfig) -> Result<TrainSummary> {
    let preprocessor = Preprocessor::new(config.preprocess.clone()).context("前処理設定が不正です")?;
    let (dataset, load_report) = Dataset::load(&config.dataset.root, &config.dataset, &preprocessor)
        .with_context(|| format!("データセットの読み込みに失敗しました: {}", config.dataset.root.display()))?;
    if dataset.is_empty() {
        bail!("データセットが空です: {}", config.dataset.root.display());
    }

    let (train_set, test_set) = dataset.split(config.training.train_ratio, config.training.seed);
    log::info!("学習 {} 件 / 検証 {} 件", train_set.len(), test_set.len());

    let reducer = if config.reducer.enabled {
        let pca = Pca::fit(train_set.features(), &config.reducer).context("PCAの推定に失敗しました")?;
        log::info!("PCA: {} -> {} 次元", pca.input_dim(), pca.output_dim());
        Some(pca)
    } else {
        None
    };
    let reduce = |set: &Dataset| -> Result<ndarray::Array2<f32>> {
        Ok(match &reducer {
            Some(pca) => pca.transform(set.features())?,
            None => set.features().clone(),
        })
    };

    let train_x = reduce(&train_set)?;
    let svm = Svm::fit(&train_x, train_set.labels(), &config.classifier).context("SVMの学習に失敗しました")?;
    let fit_info = svm.fit_info();

    let report = if test_set.is_empty() {
        log::warn!("検証データが無いため評価を省略します");
        None
    } else {
        let predicted = svm.predict(&reduce(&test_set)?)?;
        let report = ClassificationReport::evaluate(test_set.labels(), &predicted);
        println!("{}", report);
        println!("{:.2}% of samples were correctly classified", report.accuracy * 100.0);
        Some(report)
    };

    let reducer_path = match &reducer {
        Some(pca) => {
            let metadata = BundleMetadata::new(Algorithm::Pca, pca.input_dim(), pca.output_dim())
                .with_note("train_samples", train_set.len())
                .with_note("seed", config.reducer.seed);
            Some(
                save_model(&config.artifacts.reducer_path, pca, &metadata)
                    .context("PCAバンドルの保存に失敗しました")?,
            )
        }
        None => None,
    };

    let mut metadata = BundleMetadata::new(Algorithm::Svc, svm.n_features(), 1)
        .with_note("train_samples", train_set.len())
        .with_note("dropped_samples", load_report.dropped_count())
        .with_note("support_vectors", svm.support_vectors().nrows())
        .with_note("iterations", fit_info.iterations)
        .with_note("converged", fit_info.converged);
    if let Some(report) = &report {
        metadata = metadata.with_note("test_accuracy", format!("{:.4}", report.accuracy));
    }
    let classifier_path = save_model(&config.artifacts.classifier_path, &svm, &metadata)
        .context("SVMバンドルの保存に失敗しました")?;

    Ok(TrainSummary {
        train_samples: train_set.len(),
        report,
        reducer_path,
        classifier_path,
        converged: fit_info.converged,
    })
}

/// 保存済みバンドルからパイプラインを読み込む
pub fn load_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    Pipeline::load(config).context("学習済みモデルの読み込みに失敗しました。先に train を実行してください")
}

/// データセット全体に対する推論時間を計測する
pub fn benchmark(config: &PipelineConfig) -> Result<BenchmarkReport> {
    let pipeline = load_pipeline(config)?;
    let (dataset, _) = Dataset::load(&config.dataset.root, &config.dataset, pipeline.preprocessor())
        .with_context(|| format!("データセットの読み込みに失敗しました: {}", config.dataset.root.display()))?;
    let dataset = match config.benchmark.max_rows {
        Some(n) => dataset.truncate(n),
        None => dataset,
    };

    let report = run_benchmark(&pipeline, &dataset, &config.benchmark).context("ベンチマークに失敗しました")?;
    println!("{}", report);
    Ok(report)
}

/// カテゴリディレクトリを監査し、誤判定画像を退避する
pub fn audit(config: &PipelineConfig, category: usize) -> Result<AuditReport> {
    let Some(label) = Label::from_index(category) else {
        bail!("カテゴリ番号は 0 または 1 です: {}", category);
    };
    let pipeline = load_pipeline(config)?;
    let category_dir = config.dataset.root.join(&config.dataset.categories[label.index()]);

    let report = run_audit(&pipeline, &category_dir, label, &config.dataset.wrong_dir)
        .with_context(|| format!("監査に失敗しました: {}", category_dir.display()))?;
    println!(
        "{} 枚中 {} 枚を {} へ移動しました（スキップ {} 枚）",
        report.scanned,
        report.moved.len(),
        config.dataset.wrong_dir.display(),
        report.skipped.len()
    );
    Ok(report)
}

/// 保存済みバンドルをONNXにエクスポートする
pub fn export(config: &PipelineConfig) -> Result<PathBuf> {
    let reducer = if config.reducer.enabled {
        let (_, pca) = load_model::<Pca>(&config.artifacts.reducer_path)
            .with_context(|| format!("PCAバンドルを読み込めません: {}", config.artifacts.reducer_path.display()))?;
        Some(pca)
    } else {
        None
    };
    let (_, svm) = load_model::<Svm>(&config.artifacts.classifier_path)
        .with_context(|| format!("SVMバンドルを読み込めません: {}", config.artifacts.classifier_path.display()))?;

    let path = config.artifacts.onnx_path.clone();
    let written = export_to_file(&path, reducer.as_ref(), &svm, config.preprocess.feature_len())
        .context("ONNXエクスポートに失敗しました")?;
    println!("{} ({} bytes)", path.display(), written);
    Ok(path)
}

/// フレーム画像ディレクトリからイベント時刻を検出する
pub fn detect(config: &PipelineConfig, frames: &Path, rate: Option<f64>) -> Result<Vec<Duration>> {
    let mut settings = config.detect.clone();
    if let Some(rate) = rate {
        settings.rate = rate;
    }
    let pipeline = load_pipeline(config)?;
    let events = detect_in_directory(&pipeline, frames, &settings)
        .with_context(|| format!("イベント検出に失敗しました: {}", frames.display()))?;
    for stamp in &events {
        println!("{}", format_timestamp(*stamp));
    }
    Ok(events)
}

/// 元解像度の画像から切り出し領域を別ファイルに書き出す
pub fn crop(config: &PipelineConfig, src: &Path, dest: &Path) -> Result<bool> {
    let preprocessor = Preprocessor::new(config.preprocess.clone()).context("前処理設定が不正です")?;
    let written = preprocessor
        .materialize_crop(src, dest)
        .with_context(|| format!("切り出しに失敗しました: {}", src.display()))?;
    if written {
        println!("{} -> {}", src.display(), dest.display());
    } else {
        println!(
            "{} は元解像度 ({}x{}) ではないため切り出しません",
            src.display(),
            config.preprocess.raw_width,
            config.preprocess.raw_height
        );
    }
    Ok(written)
}

/// バンドルまたはONNXファイルの内容を表示する
pub fn info(path: &Path) -> Result<String> {
    let text = if path.extension().and_then(|s| s.to_str()) == Some("onnx") {
        let bytes = std::fs::read(path).with_context(|| format!("ファイルを読み込めません: {}", path.display()))?;
        let model = decode_model(&bytes).with_context(|| format!("ONNXとして読み込めません: {}", path.display()))?;
        describe_onnx(&model)
    } else {
        let metadata =
            load_metadata(path).with_context(|| format!("メタデータを読み込めません: {}", path.display()))?;
        describe_metadata(&metadata)
    };
    println!("{}", text);
    Ok(text)
}

fn describe_onnx(model: &crate::export::onnx_proto::ModelProto) -> String {
    let mut lines = vec![
        "=== ONNXモデル ===".to_string(),
        format!("IRバージョン: {}", model.ir_version),
        format!("作成: {} {}", model.producer_name, model.producer_version),
    ];
    for opset in &model.opset_import {
        let domain = if opset.domain.is_empty() { "ai.onnx" } else { opset.domain.as_str() };
        lines.push(format!("opset: {} v{}", domain, opset.version));
    }
    if let Some(graph) = &model.graph {
        let names = |values: &[crate::export::onnx_proto::ValueInfoProto]| {
            values.iter().map(|v| v.name.as_str()).collect::<Vec<_>>().join(", ")
        };
        lines.push(format!("入力: {}", names(&graph.input)));
        lines.push(format!("出力: {}", names(&graph.output)));
        lines.push(format!(
            "ノード: {}",
            graph.node.iter().map(|n| n.op_type.as_str()).collect::<Vec<_>>().join(" -> ")
        ));
    }
    lines.push("==================".to_string());
    lines.join("\n")
}

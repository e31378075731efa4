//! モデルバンドルの永続化
//!
//! Tar.gz形式でパラメータとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（フォーマットバージョン、アルゴリズム、入出力次元）
//! - params.json     - 学習済みパラメータ

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tar::{Archive, Builder};

use crate::error::{PipelineError, Result};
use crate::ml::pca::Pca;
use crate::ml::svm::Svm;
use crate::model::model_metadata::{Algorithm, BundleMetadata, FORMAT_VERSION};

const METADATA_ENTRY: &str = "metadata.json";
const PARAMS_ENTRY: &str = "params.json";

/// バンドルとして保存できる学習済みモデル
pub trait Bundled: Serialize + DeserializeOwned {
    const ALGORITHM: Algorithm;

    fn input_dim(&self) -> usize;
    fn output_dim(&self) -> usize;
    /// 読み込み後のパラメータ整合性検証
    fn validate(&self) -> Result<()>;
}

impl Bundled for Pca {
    const ALGORITHM: Algorithm = Algorithm::Pca;

    fn input_dim(&self) -> usize {
        Pca::input_dim(self)
    }

    fn output_dim(&self) -> usize {
        Pca::output_dim(self)
    }

    fn validate(&self) -> Result<()> {
        Pca::validate(self)
    }
}

impl Bundled for Svm {
    const ALGORITHM: Algorithm = Algorithm::Svc;

    fn input_dim(&self) -> usize {
        self.n_features()
    }

    fn output_dim(&self) -> usize {
        1
    }

    fn validate(&self) -> Result<()> {
        Svm::validate(self)
    }
}

/// 保存先パス。`.gz` で終わらなければ `.tar.gz` を付ける
pub fn bundle_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 実際に書き込んだパスを返します。
pub fn save_model<M: Bundled>(output_path: &Path, model: &M, metadata: &BundleMetadata) -> Result<PathBuf> {
    if metadata.algorithm != M::ALGORITHM {
        return Err(PipelineError::Bundle(format!(
            "metadata declares '{}' but model is '{}'",
            metadata.algorithm,
            M::ALGORITHM
        )));
    }

    let tar_gz_path = bundle_path(output_path);
    if let Some(parent) = tar_gz_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }

    let tar_gz_file = File::create(&tar_gz_path).map_err(|e| PipelineError::io(&tar_gz_path, e))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let metadata_json = metadata.to_json_string()?;
    let params_json = serde_json::to_string(model)?;
    append_entry(&mut tar_builder, METADATA_ENTRY, metadata_json.as_bytes(), &tar_gz_path)?;
    append_entry(&mut tar_builder, PARAMS_ENTRY, params_json.as_bytes(), &tar_gz_path)?;

    let encoder = tar_builder
        .into_inner()
        .map_err(|e| PipelineError::io(&tar_gz_path, e))?;
    encoder.finish().map_err(|e| PipelineError::io(&tar_gz_path, e))?;

    log::info!("{} バンドルを保存しました: {}", M::ALGORITHM, tar_gz_path.display());
    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(
    builder: &mut Builder<W>,
    name: &str,
    bytes: &[u8],
    archive_path: &Path,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, bytes)
        .map_err(|e| PipelineError::io(archive_path, e))
}

/// Tar.gzから (metadata.json, params.json) の内容を読み込む
fn read_entries(tar_gz_path: &Path) -> Result<(Option<String>, Option<String>)> {
    let tar_gz_file = File::open(tar_gz_path).map_err(|e| PipelineError::io(tar_gz_path, e))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));
    let io_err = |e| PipelineError::io(tar_gz_path, e);

    let mut metadata = None;
    let mut params = None;
    for entry in archive.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let name = entry.path().map_err(io_err)?.to_string_lossy().into_owned();
        let slot = match name.as_str() {
            METADATA_ENTRY => &mut metadata,
            PARAMS_ENTRY => &mut params,
            _ => continue,
        };
        let mut content = String::new();
        entry.read_to_string(&mut content).map_err(io_err)?;
        *slot = Some(content);
    }
    Ok((metadata, params))
}

/// Tar.gzからメタデータのみを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<BundleMetadata> {
    let (metadata, _) = read_entries(tar_gz_path)?;
    let json = metadata.ok_or_else(|| missing_entry(METADATA_ENTRY))?;
    BundleMetadata::from_json_string(&json)
}

/// Tar.gzからモデルを読み込み、メタデータと照合する
pub fn load_model<M: Bundled>(tar_gz_path: &Path) -> Result<(BundleMetadata, M)> {
    let (metadata, params) = read_entries(tar_gz_path)?;
    let metadata = BundleMetadata::from_json_string(&metadata.ok_or_else(|| missing_entry(METADATA_ENTRY))?)?;

    if metadata.format_version != FORMAT_VERSION {
        return Err(PipelineError::Bundle(format!(
            "unsupported format version {} (expected {})",
            metadata.format_version, FORMAT_VERSION
        )));
    }
    if metadata.algorithm != M::ALGORITHM {
        return Err(PipelineError::Bundle(format!(
            "{} contains '{}' but '{}' was requested",
            tar_gz_path.display(),
            metadata.algorithm,
            M::ALGORITHM
        )));
    }

    let model: M = serde_json::from_str(&params.ok_or_else(|| missing_entry(PARAMS_ENTRY))?)?;
    model.validate()?;
    if model.input_dim() != metadata.input_dim || model.output_dim() != metadata.output_dim {
        return Err(PipelineError::Bundle(format!(
            "parameters are {}->{} but metadata declares {}->{}",
            model.input_dim(),
            model.output_dim(),
            metadata.input_dim,
            metadata.output_dim
        )));
    }
    Ok((metadata, model))
}

fn missing_entry(name: &str) -> PipelineError {
    PipelineError::Bundle(format!("{} not found in tar.gz archive", name))
}

/// メタデータの表示用文字列
pub fn describe_metadata(metadata: &BundleMetadata) -> String {
    let mut lines = vec![
        "=== モデルメタデータ ===".to_string(),
        format!("アルゴリズム: {}", metadata.algorithm),
        format!("フォーマットバージョン: {}", metadata.format_version),
        format!("入力次元: {}", metadata.input_dim),
        format!("出力次元: {}", metadata.output_dim),
        format!("作成日時: {}", metadata.created_at),
    ];
    if !metadata.producer_version.is_empty() {
        lines.push(format!("作成バージョン: {}", metadata.producer_version));
    }
    for (key, value) in &metadata.notes {
        lines.push(format!("  {}: {}", key, value));
    }
    lines.push("========================".to_string());
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::ReducerSettings;
    use ndarray::Array2;

    fn small_pca() -> Pca {
        let x = Array2::from_shape_fn((12, 5), |(i, j)| ((i * 3 + j * 7) % 5) as f32 + i as f32 * 0.5);
        let settings = ReducerSettings {
            n_components: 3,
            ..ReducerSettings::default()
        };
        Pca::fit(&x, &settings).unwrap()
    }

    #[test]
    fn test_bundle_path_extension() {
        assert_eq!(bundle_path(Path::new("pca")), PathBuf::from("pca.tar.gz"));
        assert_eq!(bundle_path(Path::new("out/pca.tar.gz")), PathBuf::from("out/pca.tar.gz"));
    }

    #[test]
    fn test_save_then_load_preserves_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let pca = small_pca();
        let metadata = BundleMetadata::new(Algorithm::Pca, 5, 3).with_note("samples", 12);

        let path = save_model(&dir.path().join("nested").join("pca"), &pca, &metadata).unwrap();
        assert!(path.ends_with("pca.tar.gz"));

        let (loaded_meta, loaded) = load_model::<Pca>(&path).unwrap();
        assert_eq!(loaded, pca);
        assert_eq!(loaded_meta, metadata);
        assert_eq!(load_metadata(&path).unwrap().notes["samples"], "12");
        assert!(describe_metadata(&loaded_meta).contains("pca"));
    }

    #[test]
    fn test_wrong_algorithm_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pca = small_pca();
        let path = save_model(&dir.path().join("pca.tar.gz"), &pca, &BundleMetadata::new(Algorithm::Pca, 5, 3)).unwrap();

        let err = load_model::<Svm>(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Bundle(_)));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pca = small_pca();
        let mut metadata = BundleMetadata::new(Algorithm::Pca, 5, 3);
        metadata.format_version = FORMAT_VERSION + 1;
        let path = save_model(&dir.path().join("pca.tar.gz"), &pca, &metadata).unwrap();

        let err = load_model::<Pca>(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Bundle(msg) if msg.contains("version")));
    }

    #[test]
    fn test_declared_dimensions_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let pca = small_pca();
        let path = save_model(&dir.path().join("pca.tar.gz"), &pca, &BundleMetadata::new(Algorithm::Pca, 6, 3)).unwrap();
        assert!(matches!(load_model::<Pca>(&path), Err(PipelineError::Bundle(_))));
    }

    #[test]
    fn test_metadata_mismatch_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_model(&dir.path().join("x"), &small_pca(), &BundleMetadata::new(Algorithm::Svc, 5, 1)).unwrap_err();
        assert!(matches!(err, PipelineError::Bundle(_)));
    }
}

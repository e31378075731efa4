//! 学習データの監査（誤判定画像の退避）

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{PipelineError, Result};
use crate::ml::dataset::list_images;
use crate::ml::pipeline::Pipeline;
use crate::types::Label;

/// 監査結果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuditReport {
    /// 走査した画像数
    pub scanned: usize,
    /// 退避先に移動した画像（移動後のパス）
    pub moved: Vec<PathBuf>,
    /// 形状不一致でスキップした画像
    pub skipped: Vec<PathBuf>,
}

/// カテゴリディレクトリ内の画像を分類し、ラベルと一致しない画像を `wrong_dir` へ移動する
pub fn run_audit(pipeline: &Pipeline, category_dir: &Path, label: Label, wrong_dir: &Path) -> Result<AuditReport> {
    let files = list_images(category_dir)?;
    log::info!("監査開始: {} ({} 枚, 期待ラベル {})", category_dir.display(), files.len(), label);

    let mut report = AuditReport::default();
    for path in files {
        report.scanned += 1;
        let predicted = match pipeline.classify_image(&path) {
            Ok(predicted) => predicted,
            Err(PipelineError::ShapeMismatch { .. }) => {
                log::warn!("形状不一致のためスキップ: {}", path.display());
                report.skipped.push(path);
                continue;
            }
            Err(e) => return Err(e),
        };
        if predicted == label {
            continue;
        }

        let Some(file_name) = path.file_name() else {
            continue;
        };
        fs::create_dir_all(wrong_dir).map_err(|e| PipelineError::io(wrong_dir, e))?;
        let dest = free_destination(wrong_dir, category_dir, Path::new(file_name));
        move_file(&path, &dest)?;
        log::warn!("Wrong prediction for {}", file_name.to_string_lossy());
        report.moved.push(dest);
    }

    log::info!(
        "監査完了: {} 枚中 {} 枚を移動, {} 枚をスキップ",
        report.scanned,
        report.moved.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// 退避先で既存ファイルと衝突しないパス
///
/// `wrong/<名前>` が使われていれば `wrong/<カテゴリ>_<名前>`、それも使われていれば
/// `wrong/<カテゴリ>_<語幹>_<連番>.<拡張子>` を使います。
fn free_destination(wrong_dir: &Path, category_dir: &Path, file_name: &Path) -> PathBuf {
    let plain = wrong_dir.join(file_name);
    if !plain.exists() {
        return plain;
    }

    let category = category_dir
        .file_name()
        .map(|c| c.to_string_lossy().into_owned())
        .unwrap_or_else(|| "category".to_string());
    let prefixed = wrong_dir.join(format!("{}_{}", category, file_name.to_string_lossy()));
    if !prefixed.exists() {
        return prefixed;
    }

    let stem = file_name.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let ext = file_name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (1usize..)
        .map(|n| wrong_dir.join(format!("{}_{}_{}{}", category, stem, n, ext)))
        .find(|candidate| !candidate.exists())
        .unwrap_or(prefixed)
}

/// リネームできない場合（別デバイスなど）はコピーして削除する
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest).map_err(|e| PipelineError::io(dest, e))?;
    fs::remove_file(src).map_err(|e| PipelineError::io(src, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::svm::Svm;
    use crate::model::config::{ClassifierSettings, CropRegion, KernelChoice, PreprocessSettings};
    use crate::preprocess::Preprocessor;
    use image::{GrayImage, Luma, Rgb, RgbImage};
    use ndarray::Array2;

    /// 暗い画像をイベントなし、明るい画像をイベントありと判定するパイプライン
    fn brightness_pipeline() -> Pipeline {
        let preprocessor = Preprocessor::new(PreprocessSettings {
            raw_width: 16,
            raw_height: 16,
            crop: CropRegion {
                x: 0,
                y: 0,
                width: 4,
                height: 4,
            },
            target_width: 2,
            target_height: 2,
        })
        .unwrap();
        let x = Array2::from_shape_fn((8, 12), |(i, _)| if i < 4 { 0.05 * i as f32 } else { 0.8 + 0.05 * i as f32 / 4.0 });
        let labels: Vec<Label> = (0..8)
            .map(|i| if i < 4 { Label::NoEvent } else { Label::Event })
            .collect();
        let settings = ClassifierSettings {
            kernel: KernelChoice::Linear,
            ..ClassifierSettings::default()
        };
        let svm = Svm::fit(&x, &labels, &settings).unwrap();
        Pipeline::new(preprocessor, None, svm).unwrap()
    }

    #[test]
    fn test_audit_moves_only_mispredicted_files() {
        let dir = tempfile::tempdir().unwrap();
        let category = dir.path().join("kill");
        let wrong = dir.path().join("wrong");
        fs::create_dir_all(&category).unwrap();

        RgbImage::from_pixel(4, 4, Rgb([250, 250, 250])).save(category.join("a.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([240, 240, 240])).save(category.join("b.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([5, 5, 5])).save(category.join("c.png")).unwrap();
        GrayImage::from_pixel(4, 4, Luma([250])).save(category.join("d.png")).unwrap();

        let report = run_audit(&brightness_pipeline(), &category, Label::Event, &wrong).unwrap();

        assert_eq!(report.scanned, 4);
        assert_eq!(report.moved, vec![wrong.join("c.png")]);
        assert_eq!(report.skipped, vec![category.join("d.png")]);
        assert!(wrong.join("c.png").exists());
        assert!(!category.join("c.png").exists());
        assert!(category.join("a.png").exists());
        assert!(category.join("b.png").exists());
    }

    #[test]
    fn test_audit_keeps_same_named_files_from_both_categories() {
        let dir = tempfile::tempdir().unwrap();
        let kill = dir.path().join("kill");
        let no_kill = dir.path().join("no_kill");
        let wrong = dir.path().join("wrong");
        fs::create_dir_all(&kill).unwrap();
        fs::create_dir_all(&no_kill).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([5, 5, 5])).save(kill.join("f.png")).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([250, 250, 250])).save(no_kill.join("f.png")).unwrap();

        let pipeline = brightness_pipeline();
        let first = run_audit(&pipeline, &kill, Label::Event, &wrong).unwrap();
        let second = run_audit(&pipeline, &no_kill, Label::NoEvent, &wrong).unwrap();

        assert_eq!(first.moved, vec![wrong.join("f.png")]);
        assert_eq!(second.moved, vec![wrong.join("no_kill_f.png")]);
        assert_eq!(fs::read_dir(&wrong).unwrap().count(), 2);
        let dark = image::open(wrong.join("f.png")).unwrap().to_rgb8();
        assert_eq!(dark.get_pixel(0, 0), &Rgb([5, 5, 5]));
    }

    #[test]
    fn test_free_destination_adds_counter() {
        let dir = tempfile::tempdir().unwrap();
        let wrong = dir.path().join("wrong");
        fs::create_dir_all(&wrong).unwrap();
        fs::write(wrong.join("f.png"), b"a").unwrap();
        fs::write(wrong.join("kill_f.png"), b"b").unwrap();

        let dest = free_destination(&wrong, &dir.path().join("kill"), Path::new("f.png"));
        assert_eq!(dest, wrong.join("kill_f_1.png"));
    }

    #[test]
    fn test_audit_without_mistakes_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let category = dir.path().join("no_kill");
        let wrong = dir.path().join("wrong");
        fs::create_dir_all(&category).unwrap();
        RgbImage::from_pixel(4, 4, Rgb([3, 3, 3])).save(category.join("a.png")).unwrap();

        let report = run_audit(&brightness_pipeline(), &category, Label::NoEvent, &wrong).unwrap();
        assert!(report.moved.is_empty());
        assert!(!wrong.exists());
    }
}

//! 画像前処理
//!
//! 画像1枚を固定長の特徴ベクトルに変換します。
//!
//! 処理順序:
//! 1. 元解像度（録画そのまま、既定 1920x1080）の画像であればキル表示位置を切り出す
//! 2. 固定サイズ（既定 50x50）にリサイズ
//! 3. 8bit輝度を 255 で割って [0, 1] に正規化
//! 4. HWC順で平坦化
//!
//! 元ファイルは書き換えません。切り出し画像が必要な場合は
//! [`Preprocessor::materialize_crop`] で別パスに書き出します。

use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};

use crate::error::{PipelineError, Result};
use crate::model::config::PreprocessSettings;

/// 前処理に失敗したフレームに付けるパス表示
const FRAME_PATH: &str = "<frame>";

/// 画像前処理器
#[derive(Debug, Clone)]
pub struct Preprocessor {
    settings: PreprocessSettings,
}

impl Preprocessor {
    /// 設定を検証して前処理器を作成
    pub fn new(settings: PreprocessSettings) -> Result<Self> {
        let crop = settings.crop;
        if crop.width == 0 || crop.height == 0 {
            return Err(PipelineError::InvalidArgument(
                "crop region must not be empty".to_string(),
            ));
        }
        if crop.x + crop.width > settings.raw_width || crop.y + crop.height > settings.raw_height {
            return Err(PipelineError::InvalidArgument(format!(
                "crop region ({}, {}) {}x{} exceeds raw capture size {}x{}",
                crop.x, crop.y, crop.width, crop.height, settings.raw_width, settings.raw_height
            )));
        }
        if settings.target_width == 0 || settings.target_height == 0 {
            return Err(PipelineError::InvalidArgument(
                "target size must not be empty".to_string(),
            ));
        }
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    /// 出力される特徴ベクトル長
    pub fn feature_len(&self) -> usize {
        self.settings.feature_len()
    }

    /// 元解像度の画像かどうか
    pub fn is_raw_capture(&self, width: u32, height: u32) -> bool {
        width == self.settings.raw_width && height == self.settings.raw_height
    }

    /// 画像ファイルを読み込んで特徴ベクトルに変換
    ///
    /// RGB以外（グレースケール・RGBA）の画像は `ShapeMismatch` になります。
    pub fn preprocess(&self, path: &Path) -> Result<Vec<f32>> {
        let img = open_image(path)?;
        self.preprocess_image(&img, path)
    }

    /// デコード済み画像を特徴ベクトルに変換
    pub fn preprocess_image(&self, img: &DynamicImage, path: &Path) -> Result<Vec<f32>> {
        let channels = img.color().channel_count() as usize;
        if channels != 3 {
            return Err(PipelineError::ShapeMismatch {
                path: path.to_path_buf(),
                expected: self.feature_len(),
                actual: self.settings.target_width as usize
                    * self.settings.target_height as usize
                    * channels,
            });
        }
        self.features_from_rgb(img.to_rgb8(), path)
    }

    /// RGB8の生フレーム（動画デコーダ出力など）を特徴ベクトルに変換
    pub fn preprocess_rgb_frame(&self, raw: &[u8], width: u32, height: u32) -> Result<Vec<f32>> {
        let expected = width as usize * height as usize * 3;
        let frame = RgbImage::from_raw(width, height, raw.to_vec()).ok_or_else(|| {
            PipelineError::ShapeMismatch {
                path: PathBuf::from(FRAME_PATH),
                expected,
                actual: raw.len(),
            }
        })?;
        self.features_from_rgb(frame, Path::new(FRAME_PATH))
    }

    /// 元解像度であれば切り出し領域を返す（それ以外はそのまま）
    pub fn crop_if_raw(&self, rgb: RgbImage) -> RgbImage {
        if self.is_raw_capture(rgb.width(), rgb.height()) {
            let crop = self.settings.crop;
            imageops::crop_imm(&rgb, crop.x, crop.y, crop.width, crop.height).to_image()
        } else {
            rgb
        }
    }

    fn features_from_rgb(&self, rgb: RgbImage, path: &Path) -> Result<Vec<f32>> {
        let cropped = self.crop_if_raw(rgb);
        let resized = imageops::resize(
            &cropped,
            self.settings.target_width,
            self.settings.target_height,
            FilterType::Triangle,
        );

        let values: Vec<f32> = resized
            .into_raw()
            .into_iter()
            .map(|v| f32::from(v) / 255.0)
            .collect();

        if values.len() != self.feature_len() {
            return Err(PipelineError::ShapeMismatch {
                path: path.to_path_buf(),
                expected: self.feature_len(),
                actual: values.len(),
            });
        }
        Ok(values)
    }

    /// 切り出し画像を別ファイルに書き出す
    ///
    /// 元解像度の画像でなければ何も書き出さず `false` を返します。
    /// 元ファイルへの上書きはエラーです。
    pub fn materialize_crop(&self, src: &Path, dest: &Path) -> Result<bool> {
        if same_file(src, dest) {
            return Err(PipelineError::InvalidArgument(format!(
                "refusing to overwrite source image {}",
                src.display()
            )));
        }

        let img = open_image(src)?;
        if !self.is_raw_capture(img.width(), img.height()) {
            return Ok(false);
        }

        let cropped = self.crop_if_raw(img.to_rgb8());
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
        }
        cropped.save(dest).map_err(|e| PipelineError::image(dest, e))?;
        Ok(true)
    }
}

/// 浮動小数の画素値ベクトル用: 値が1つでも [0, 1] の範囲外にあれば全体を 255 で割る
///
/// 既に正規化済みのベクトルに対しては何もしません。8bit画像は常に 255 で割るため使いません。
pub fn normalize_unit_range(values: &mut [f32]) {
    if values.iter().any(|v| *v > 1.0 || *v < 0.0) {
        for v in values.iter_mut() {
            *v /= 255.0;
        }
    }
}

/// 画像を開く。ファイルが無い場合は `Io`、デコード失敗は `Image`
pub(crate) fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| match e {
        image::ImageError::IoError(io) => PipelineError::io(path, io),
        other => PipelineError::image(path, other),
    })
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::CropRegion;
    use image::{GrayImage, Luma, Rgb};

    fn small_settings() -> PreprocessSettings {
        PreprocessSettings {
            raw_width: 64,
            raw_height: 48,
            crop: CropRegion {
                x: 20,
                y: 10,
                width: 16,
                height: 16,
            },
            target_width: 8,
            target_height: 8,
        }
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let mut values = vec![0.0, 12.0, 255.0, 128.0];
        normalize_unit_range(&mut values);
        let once = values.clone();
        normalize_unit_range(&mut values);
        assert_eq!(once, values);
        assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_normalize_keeps_unit_values() {
        let mut values = vec![0.0, 0.25, 1.0];
        normalize_unit_range(&mut values);
        assert_eq!(values, vec![0.0, 0.25, 1.0]);
    }

    #[test]
    fn test_dark_pixels_keep_intensity_order() {
        let pre = Preprocessor::new(small_settings()).unwrap();
        let darker = pre
            .preprocess_image(&DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([1, 1, 1]))), Path::new("a"))
            .unwrap();
        let brighter = pre
            .preprocess_image(&DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([2, 2, 2]))), Path::new("b"))
            .unwrap();

        assert!((darker[0] - 1.0 / 255.0).abs() < 1e-6);
        assert!(darker.iter().zip(brighter.iter()).all(|(d, b)| d < b));

        let black = pre
            .preprocess_image(&DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]))), Path::new("c"))
            .unwrap();
        assert!(black.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_invalid_crop_is_rejected() {
        let mut settings = small_settings();
        settings.crop.x = 60;
        assert!(Preprocessor::new(settings).is_err());
    }

    #[test]
    fn test_output_ignores_pixels_outside_crop() {
        let pre = Preprocessor::new(small_settings()).unwrap();

        let base = RgbImage::from_pixel(64, 48, Rgb([30, 60, 90]));
        let mut noisy = base.clone();
        for (x, y, px) in noisy.enumerate_pixels_mut() {
            let inside = (20..36).contains(&x) && (10..26).contains(&y);
            if !inside {
                *px = Rgb([255, (x % 256) as u8, (y % 256) as u8]);
            }
        }

        let a = pre
            .preprocess_image(&DynamicImage::ImageRgb8(base), Path::new("a"))
            .unwrap();
        let b = pre
            .preprocess_image(&DynamicImage::ImageRgb8(noisy), Path::new("b"))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8 * 8 * 3);
    }

    #[test]
    fn test_marker_inside_crop_changes_output() {
        let pre = Preprocessor::new(small_settings()).unwrap();

        let plain = RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]));
        let mut marked = plain.clone();
        for y in 14..22 {
            for x in 24..32 {
                marked.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }

        let a = pre
            .preprocess_image(&DynamicImage::ImageRgb8(plain), Path::new("a"))
            .unwrap();
        let b = pre
            .preprocess_image(&DynamicImage::ImageRgb8(marked), Path::new("b"))
            .unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_grayscale_is_shape_mismatch() {
        let pre = Preprocessor::new(small_settings()).unwrap();
        let gray = GrayImage::from_pixel(8, 8, Luma([100]));
        let err = pre
            .preprocess_image(&DynamicImage::ImageLuma8(gray), Path::new("g.png"))
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ShapeMismatch { expected: 192, actual: 64, .. }
        ));
    }

    #[test]
    fn test_raw_frame_length_is_checked() {
        let pre = Preprocessor::new(small_settings()).unwrap();
        let err = pre.preprocess_rgb_frame(&[0u8; 10], 8, 8).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { .. }));

        let ok = pre.preprocess_rgb_frame(&[255u8; 8 * 8 * 3], 8, 8).unwrap();
        assert!(ok.iter().all(|v| *v > 0.99 && *v <= 1.0));
    }

    #[test]
    fn test_materialize_crop_writes_copy_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("frame.png");
        RgbImage::from_pixel(64, 48, Rgb([10, 20, 30])).save(&src).unwrap();
        let before = std::fs::read(&src).unwrap();

        let pre = Preprocessor::new(small_settings()).unwrap();
        let dest = dir.path().join("cropped").join("frame.png");
        assert!(pre.materialize_crop(&src, &dest).unwrap());

        let cropped = image::open(&dest).unwrap();
        assert_eq!((cropped.width(), cropped.height()), (16, 16));
        assert_eq!(std::fs::read(&src).unwrap(), before);

        assert!(pre.materialize_crop(&src, &src).is_err());
    }

    #[test]
    fn test_materialize_crop_skips_non_raw_images() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("small.png");
        RgbImage::from_pixel(8, 8, Rgb([1, 2, 3])).save(&src).unwrap();

        let pre = Preprocessor::new(small_settings()).unwrap();
        let dest = dir.path().join("out.png");
        assert!(!pre.materialize_crop(&src, &dest).unwrap());
        assert!(!dest.exists());
    }
}

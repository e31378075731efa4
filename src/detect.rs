//! フレーム列からのイベント検出
//!
//! 一定レートで取り出したフレームの判定結果を時系列に並べ、イベント発生時刻に変換します。
//! 一度イベントを検出したら、`2 × レート` を超える連続した非検出フレームが来るまで
//! 次のイベントを出しません。

use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::ml::dataset::list_images;
use crate::ml::pipeline::Pipeline;
use crate::model::config::DetectSettings;
use crate::types::Label;

/// 判定結果を逐次受け取ってイベント時刻を返す検出器
#[derive(Debug, Clone)]
pub struct EventDetector {
    rate: f64,
    required_detections: usize,
    first_stamp: Option<Duration>,
    wait_for_toggle: bool,
    consecutive_detections: usize,
    consecutive_non_detections: usize,
}

impl EventDetector {
    pub fn new(settings: &DetectSettings) -> Result<Self> {
        if !(settings.rate > 0.0) {
            return Err(PipelineError::InvalidArgument(format!(
                "analysis rate must be positive, got {}",
                settings.rate
            )));
        }
        if settings.required_detections == 0 {
            return Err(PipelineError::InvalidArgument(
                "required_detections must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            rate: settings.rate,
            required_detections: settings.required_detections,
            first_stamp: None,
            wait_for_toggle: false,
            consecutive_detections: 0,
            consecutive_non_detections: 0,
        })
    }

    /// フレーム番号からタイムスタンプ（index / rate 秒）
    pub fn timestamp(&self, index: usize) -> Duration {
        Duration::from_secs_f64(index as f64 / self.rate)
    }

    /// 1フレーム分の判定を入力し、イベントが確定したらその開始時刻を返す
    pub fn push(&mut self, timestamp: Duration, detected: bool) -> Option<Duration> {
        if self.wait_for_toggle {
            if detected {
                self.consecutive_non_detections = 0;
            } else {
                self.consecutive_non_detections += 1;
                if self.consecutive_non_detections as f64 > 2.0 * self.rate {
                    self.wait_for_toggle = false;
                    self.consecutive_non_detections = 0;
                }
            }
            return None;
        }

        if !detected {
            if self.consecutive_detections > 0 {
                log::warn!("イベント候補が途切れました ({:?})", timestamp);
            }
            self.consecutive_detections = 0;
            self.first_stamp = None;
            return None;
        }

        let first = *self.first_stamp.get_or_insert(timestamp);
        self.consecutive_detections += 1;
        if self.consecutive_detections < self.required_detections {
            return None;
        }

        log::debug!("イベント検出: {:?}", first);
        self.first_stamp = None;
        self.consecutive_detections = 0;
        self.wait_for_toggle = true;
        Some(first)
    }
}

/// 判定列 (時刻, 検出) からイベント時刻を求める
pub fn detect_events(
    settings: &DetectSettings,
    frames: impl IntoIterator<Item = (Duration, bool)>,
) -> Result<Vec<Duration>> {
    let mut detector = EventDetector::new(settings)?;
    Ok(frames
        .into_iter()
        .filter_map(|(stamp, detected)| detector.push(stamp, detected))
        .collect())
}

/// ファイル名順に並んだフレーム画像ディレクトリからイベント時刻を求める
///
/// 分類できないフレーム（形状不一致・デコード失敗）は警告を出して読み飛ばします。
pub fn detect_in_directory(pipeline: &Pipeline, dir: &Path, settings: &DetectSettings) -> Result<Vec<Duration>> {
    let mut detector = EventDetector::new(settings)?;
    let frames = list_images(dir)?;
    log::info!("{} フレームを解析します ({} fps)", frames.len(), settings.rate);

    let mut events = Vec::new();
    for (index, path) in frames.iter().enumerate() {
        let detected = match pipeline.classify_image(path) {
            Ok(label) => label == Label::Event,
            Err(e @ (PipelineError::ShapeMismatch { .. } | PipelineError::Image { .. })) => {
                log::warn!("フレームを分類できません: {}", e);
                continue;
            }
            Err(e) => return Err(e),
        };
        if let Some(stamp) = detector.push(detector.timestamp(index), detected) {
            events.push(stamp);
        }
    }
    log::info!("{} 件のイベントを検出しました", events.len());
    Ok(events)
}

/// HH:MM:SS.mmm 形式
pub fn format_timestamp(time: Duration) -> String {
    let millis = time.as_millis();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        millis / 3_600_000,
        millis / 60_000 % 60,
        millis / 1000 % 60,
        millis % 1000
    )
}

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// 二値ラベル（0 = イベントなし, 1 = イベントあり）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    NoEvent,
    Event,
}

impl Label {
    pub const ALL: [Label; 2] = [Label::NoEvent, Label::Event];

    /// カテゴリのインデックス（ディレクトリ順序と同じ）
    pub fn index(self) -> usize {
        match self {
            Label::NoEvent => 0,
            Label::Event => 1,
        }
    }

    /// SVMで使用する符号 (-1 / +1)
    pub fn sign(self) -> f64 {
        match self {
            Label::NoEvent => -1.0,
            Label::Event => 1.0,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Label::NoEvent),
            1 => Some(Label::Event),
            _ => None,
        }
    }
}

impl TryFrom<i64> for Label {
    type Error = PipelineError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(Label::from_index)
            .ok_or(PipelineError::InvalidLabel(value))
    }
}

impl From<Label> for i64 {
    fn from(label: Label) -> Self {
        label.index() as i64
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_roundtrip_through_integer() {
        for label in Label::ALL {
            let value: i64 = label.into();
            assert_eq!(Label::try_from(value).unwrap(), label);
        }
    }

    #[test]
    fn test_label_rejects_other_values() {
        assert!(matches!(Label::try_from(2), Err(PipelineError::InvalidLabel(2))));
        assert!(matches!(Label::try_from(-1), Err(PipelineError::InvalidLabel(-1))));
    }
}

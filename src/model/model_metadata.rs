//! モデルメタデータの定義
//!
//! tar.gz形式でモデルと一緒に保存され、推論時のクラス名と入力サイズの復元に使います。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::config::{ImageSettings, TrainingSettings};

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// モデル名（保存ファイル名とレジストリの名前）
    pub name: String,

    /// クラス名（インデックスはモデル出力と対応）
    /// 例: ["biblioteca", "cantina", "quadra"]
    pub class_names: Vec<String>,

    /// モデル入力の高さ（ピクセル）
    pub image_height: u32,

    /// モデル入力の幅（ピクセル）
    pub image_width: u32,

    /// 学習エポック数
    pub num_epochs: u32,

    pub batch_size: u32,

    pub learning_rate: f64,

    /// 分割に使ったシード
    pub seed: u64,

    /// 学習後の検証データでの正解率（0〜1）
    #[serde(default)]
    pub val_accuracy: Option<f64>,

    /// 学習に使ったデータセットの取得元
    #[serde(default)]
    pub dataset_url: Option<String>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        name: String,
        class_names: Vec<String>,
        image: ImageSettings,
        training: &TrainingSettings,
        val_accuracy: Option<f64>,
        dataset_url: Option<String>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            name,
            class_names,
            image_height: image.height as u32,
            image_width: image.width as u32,
            num_epochs: training.num_epochs as u32,
            batch_size: training.batch_size as u32,
            learning_rate: training.learning_rate,
            seed: training.seed,
            val_accuracy,
            dataset_url,
            trained_at,
        }
    }

    /// 学習時の入力サイズ
    pub fn image_settings(&self) -> ImageSettings {
        ImageSettings {
            height: self.image_height as usize,
            width: self.image_width as usize,
        }
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }

    #[cfg(test)]
    pub(crate) fn for_test(class_names: Vec<String>, image: ImageSettings) -> Self {
        Self::new(
            "test_model".to_string(),
            class_names,
            image,
            &TrainingSettings::default(),
            Some(0.75),
            None,
        )
    }
}

/// 日時からモデル名を生成
pub fn default_model_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("scene_classifier_{}", now.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn json_round_trip_keeps_class_order() {
        let image = ImageSettings { height: 180, width: 260 };
        let metadata = ModelMetadata::for_test(
            vec!["quadra".into(), "biblioteca".into(), "cantina".into()],
            image,
        );
        let json = metadata.to_json_string().unwrap();
        let restored = ModelMetadata::from_json_string(&json).unwrap();

        assert_eq!(restored, metadata);
        assert_eq!(restored.image_settings(), image);
        assert_eq!(restored.class_names[0], "quadra");
    }

    #[test]
    fn missing_optional_fields_default_to_none() {
        let json = r#"{
            "name": "m", "class_names": ["a"], "image_height": 8, "image_width": 8,
            "num_epochs": 1, "batch_size": 1, "learning_rate": 0.001, "seed": 1,
            "trained_at": "2024-01-01T00:00:00+00:00"
        }"#;
        let metadata = ModelMetadata::from_json_string(json).unwrap();
        assert_eq!(metadata.val_accuracy, None);
        assert_eq!(metadata.dataset_url, None);
    }

    #[test]
    fn model_name_uses_timestamp() {
        let now = chrono::Local.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap();
        assert_eq!(default_model_name(now), "scene_classifier_20240506_070809");
    }
}

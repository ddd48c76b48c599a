//! モデル推論機能

use anyhow::{anyhow, bail, Context, Result};
use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{activation::softmax, backend::Backend, Tensor, TensorData},
};
use image::imageops::FilterType;
use std::fmt;
use std::path::Path;

use crate::dataset::preprocess::{decode_image_pixels, CHANNELS};
use crate::http_client;
use crate::ml::{ModelConfig, SceneClassifier};
use crate::model::config::{validate_http_url, ImageSettings};
use crate::model::{load_model_with_metadata, ModelMetadata};

/// 推論用画像のリサイズに使う補間方法
pub const PREDICTION_FILTER: FilterType = FilterType::Nearest;

/// 推論結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// 最も確率の高いクラス
    pub class_name: String,
    pub class_index: usize,
    /// 確率（パーセント、0〜100）
    pub confidence: f32,
    /// クラスごとの確率分布（0〜1）
    pub probabilities: Vec<f32>,
}

impl Prediction {
    /// 確率分布から最も確率の高いクラスを選ぶ
    pub fn from_probabilities(class_names: &[String], probabilities: Vec<f32>) -> Result<Self> {
        if probabilities.len() != class_names.len() {
            bail!(
                "モデル出力の次元 ({}) とクラス数 ({}) が一致しません",
                probabilities.len(),
                class_names.len()
            );
        }
        let (class_index, best) = probabilities
            .iter()
            .copied()
            .enumerate()
            .fold(None, |acc: Option<(usize, f32)>, (i, p)| match acc {
                Some((_, best)) if best >= p => acc,
                _ => Some((i, p)),
            })
            .ok_or_else(|| anyhow!("クラスが1つもありません"))?;

        Ok(Self {
            class_name: class_names[class_index].clone(),
            class_index,
            confidence: (best * 100.0).clamp(0.0, 100.0),
            probabilities,
        })
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "この画像は '{}' と判定されました (確率 {:.2}%)",
            self.class_name, self.confidence
        )
    }
}

/// 画素列（[3, H, W]）を1枚分のバッチとして推論
pub fn predict_pixels<B: Backend>(
    model: &SceneClassifier<B>,
    class_names: &[String],
    pixels: Vec<f32>,
    size: ImageSettings,
    device: &B::Device,
) -> Result<Prediction> {
    let images = Tensor::<B, 4>::from_data(
        TensorData::new(pixels, [1, CHANNELS, size.height, size.width]),
        device,
    );
    let logits = model.forward(images);
    let probabilities = softmax(logits, 1)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("確率分布の取得エラー: {:?}", e))?;
    Prediction::from_probabilities(class_names, probabilities)
}

/// URLの画像をダウンロードして推論
pub fn predict<B: Backend>(
    model: &SceneClassifier<B>,
    class_names: &[String],
    image_url: &str,
    size: ImageSettings,
    device: &B::Device,
) -> Result<Prediction> {
    validate_http_url(image_url)?;
    tracing::info!("推論用画像をダウンロードします: {}", image_url);
    let bytes = http_client::fetch_bytes(image_url, http_client::MAX_IMAGE_BYTES)?;
    let pixels = decode_image_pixels(&bytes, size, PREDICTION_FILTER)
        .with_context(|| format!("推論用画像を読み込めません: {}", image_url))?;
    predict_pixels(model, class_names, pixels, size, device)
}

/// モデルの重みをバイト列に変換
pub fn model_to_bytes<B: Backend>(model: &SceneClassifier<B>) -> Result<Vec<u8>> {
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    recorder
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow!("モデル重みの書き出しエラー: {:?}", e))
}

/// 推論エンジン
///
/// 保存済みのモデル（tar.gz）から分類器を復元して保持する。
pub struct InferenceEngine<B: Backend> {
    model: SceneClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let model = restore_model(&metadata, model_binary, &device)?;
        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    /// URLの画像を分類
    pub fn classify_url(&self, image_url: &str) -> Result<Prediction> {
        predict(
            &self.model,
            &self.metadata.class_names,
            image_url,
            self.metadata.image_settings(),
            &self.device,
        )
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}

/// メタデータとバイト列からモデルを復元
pub fn restore_model<B: Backend>(
    metadata: &ModelMetadata,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<SceneClassifier<B>> {
    let config = ModelConfig::from_image_settings(metadata.class_names.len(), metadata.image_settings());
    config.validate()?;
    let model = config.init::<B>(device);

    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = recorder
        .load(model_binary, device)
        .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;
    Ok(model.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::test_server::{ok_response, serve_once};
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::NdArray;
    use image::{Rgb, RgbImage};
    use std::io::Cursor;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([30, 60, 90]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// 出力文字列から確率の数値を取り出す
    fn percentage_in(text: &str) -> f32 {
        let start = text.find("確率 ").unwrap() + "確率 ".len();
        let end = text.rfind('%').unwrap();
        text[start..end].parse().unwrap()
    }

    #[test]
    fn picks_highest_probability() {
        let classes = names(&["biblioteca", "cantina", "quadra"]);
        let prediction = Prediction::from_probabilities(&classes, vec![0.1, 0.7, 0.2]).unwrap();

        assert_eq!(prediction.class_name, "cantina");
        assert_eq!(prediction.class_index, 1);
        assert!((prediction.confidence - 70.0).abs() < 1e-4);
        assert_eq!(
            prediction.to_string(),
            "この画像は 'cantina' と判定されました (確率 70.00%)"
        );
    }

    #[test]
    fn rejects_mismatched_output() {
        let classes = names(&["a", "b"]);
        assert!(Prediction::from_probabilities(&classes, vec![1.0]).is_err());
        assert!(Prediction::from_probabilities(&[], vec![]).is_err());
    }

    #[test]
    fn prediction_names_exactly_one_class_with_valid_percentage() {
        let device = NdArrayDevice::Cpu;
        let size = ImageSettings { height: 16, width: 24 };
        let classes = names(&["biblioteca", "cantina", "quadra"]);
        let model = ModelConfig::from_image_settings(3, size).init::<NdArray>(&device);

        let pixels = decode_image_pixels(&png_bytes(40, 30), size, PREDICTION_FILTER).unwrap();
        let prediction = predict_pixels(&model, &classes, pixels, size, &device).unwrap();
        let text = prediction.to_string();

        let mentioned: Vec<_> = classes.iter().filter(|c| text.contains(&format!("'{}'", c))).collect();
        assert_eq!(mentioned.len(), 1);
        let percentage = percentage_in(&text);
        assert!((0.0..=100.0).contains(&percentage));
        let total: f32 = prediction.probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-4);
    }

    #[test]
    fn predicts_downloaded_image() {
        let device = NdArrayDevice::Cpu;
        let size = ImageSettings { height: 8, width: 8 };
        let classes = names(&["cats", "dogs"]);
        let model = ModelConfig::from_image_settings(2, size).init::<NdArray>(&device);
        let url = serve_once(ok_response(&png_bytes(20, 20)));

        let prediction = predict(&model, &classes, &url, size, &device).unwrap();
        assert!(classes.contains(&prediction.class_name));
    }

    #[test]
    fn model_bytes_round_trip_preserves_outputs() {
        let device = NdArrayDevice::Cpu;
        let size = ImageSettings { height: 8, width: 16 };
        let metadata = ModelMetadata::for_test(names(&["a", "b", "c"]), size);
        let model = ModelConfig::from_image_settings(3, size).init::<NdArray>(&device);

        let bytes = model_to_bytes(&model).unwrap();
        let restored = restore_model::<NdArray>(&metadata, bytes, &device).unwrap();

        let input = Tensor::<NdArray, 4>::ones([1, 3, 8, 16], &device).mul_scalar(50.0);
        let expected = model.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = restored.forward(input).into_data().to_vec::<f32>().unwrap();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(actual.iter()) {
            assert!((e - a).abs() < 1e-5);
        }
    }
}

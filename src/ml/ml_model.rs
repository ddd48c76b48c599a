//! 機械学習モデルの共通定義
//!
//! シーン分類用のCNNモデルと関連する設定を提供します。

use anyhow::bail;
use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::model::config::ImageSettings;

/// 入力画素値のスケール（0〜255 → 0〜1）
const PIXEL_SCALE: f32 = 1.0 / 255.0;

/// 各畳み込み層の出力チャネル数
const CONV_CHANNELS: [usize; 3] = [16, 32, 64];

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像の高さ
    #[config(default = 180)]
    pub image_height: usize,
    /// 入力画像の幅
    #[config(default = 260)]
    pub image_width: usize,
}

impl ModelConfig {
    /// 画像サイズ設定から作成
    pub fn from_image_settings(num_classes: usize, size: ImageSettings) -> Self {
        Self::new(num_classes)
            .with_image_height(size.height)
            .with_image_width(size.width)
    }

    /// 3回のプーリング後の特徴マップサイズ (高さ, 幅)
    pub fn feature_map_size(&self) -> (usize, usize) {
        (self.image_height / 8, self.image_width / 8)
    }

    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> usize {
        let (h, w) = self.feature_map_size();
        CONV_CHANNELS[2] * h * w
    }

    /// モデルを構築できる設定か検証
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.num_classes == 0 {
            bail!("クラス数が0です。データセットにクラスディレクトリがありません");
        }
        let (h, w) = self.feature_map_size();
        if h == 0 || w == 0 {
            bail!(
                "入力サイズが小さすぎます: {}x{} (最小8x8が必要)",
                self.image_width,
                self.image_height
            );
        }
        Ok(())
    }

    /// モデルを初期化
    ///
    /// 事前に [`ModelConfig::validate`] で検証しておくこと。
    pub fn init<B: Backend>(&self, device: &B::Device) -> SceneClassifier<B> {
        let [c1, c2, c3] = CONV_CHANNELS;
        let conv = |channels: [usize; 2]| {
            Conv2dConfig::new(channels, [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        let pool = || MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        SceneClassifier {
            conv1: conv([3, c1]),
            pool1: pool(),
            conv2: conv([c1, c2]),
            pool2: pool(),
            conv3: conv([c2, c3]),
            pool3: pool(),
            output: LinearConfig::new(self.flattened_features(), self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// シーン分類用CNNモデル
///
/// # アーキテクチャ
/// - Rescale (1/255)
/// - {Conv 3x3 (same padding) + ReLU + MaxPool 2x2} x 3層 (16, 32, 64チャネル)
/// - Flatten
/// - FC: 64 * (H/8) * (W/8) -> num_classes（ロジット）
#[derive(Module, Debug)]
pub struct SceneClassifier<B: Backend> {
    conv1: Conv2d<B>,
    pool1: MaxPool2d,
    conv2: Conv2d<B>,
    pool2: MaxPool2d,
    conv3: Conv2d<B>,
    pool3: MaxPool2d,
    output: Linear<B>,
    activation: Relu,
}

impl<B: Backend> SceneClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, height, width]（画素値 0〜255）
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = images.mul_scalar(PIXEL_SCALE);

        let x = self.conv1.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool3.forward(x);

        let x = x.flatten(1, 3);
        self.output.forward(x)
    }

    /// 順伝播と損失計算（学習用）
    ///
    /// 損失はロジットに対するクロスエントロピー。
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}

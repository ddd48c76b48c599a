//! 学習用・検証用データローダーの構築
//!
//! - 学習用: 全画像を事前にデコードしてメモリに保持し、エポックごとにシャッフル
//! - 検証用: 読み出し時にデコード、シャッフルなし
//! - どちらもワーカースレッドでバッチを先読みする

use anyhow::{Context, Result};
use burn::data::dataloader::batcher::Batcher;
use burn::data::dataloader::{DataLoader, DataLoaderBuilder};
use burn::data::dataset::{Dataset, InMemDataset};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Int, Tensor, TensorData};
use image::imageops::FilterType;
use std::path::Path;
use std::sync::Arc;

use crate::dataset::folder::{ImageFolder, ImageSample};
use crate::dataset::preprocess::{load_image_pixels, CHANNELS};
use crate::model::config::{ImageSettings, TrainingSettings};

/// データセットのリサイズに使う補間方法
pub const DATASET_FILTER: FilterType = FilterType::Triangle;

/// デコード済みの1サンプル
#[derive(Clone, Debug)]
pub struct ImageItem {
    /// (C, H, W) 順の画素値（0〜255）
    pub pixels: Vec<f32>,
    pub label: usize,
}

/// 読み出し時にデコードするデータセット
pub struct LazyImageDataset {
    samples: Vec<ImageSample>,
    size: ImageSettings,
}

impl LazyImageDataset {
    pub fn new(samples: Vec<ImageSample>, size: ImageSettings) -> Self {
        Self { samples, size }
    }
}

impl Dataset<ImageItem> for LazyImageDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let sample = self.samples.get(index)?;
        let pixels = match load_image_pixels(&sample.path, self.size, DATASET_FILTER) {
            Ok(pixels) => pixels,
            Err(e) => {
                // バッチの形を崩さないようゼロで埋める
                tracing::warn!("画像読み込み失敗 {}: {:#}", sample.path.display(), e);
                vec![0.0; CHANNELS * self.size.height * self.size.width]
            }
        };
        Some(ImageItem {
            pixels,
            label: sample.label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// 全画像をデコードしてメモリ上のデータセットにする
pub fn cache_samples(samples: &[ImageSample], size: ImageSettings) -> Result<InMemDataset<ImageItem>> {
    let items = samples
        .iter()
        .map(|sample| {
            let pixels = load_image_pixels(&sample.path, size, DATASET_FILTER)?;
            Ok(ImageItem {
                pixels,
                label: sample.label,
            })
        })
        .collect::<Result<Vec<_>>>()
        .context("学習データのキャッシュに失敗しました")?;
    Ok(InMemDataset::new(items))
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct ImageBatcher {
    size: ImageSettings,
}

impl ImageBatcher {
    pub fn new(size: ImageSettings) -> Self {
        Self { size }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// [batch_size, 3, height, width]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, ImageItem, ImageBatch<B>> for ImageBatcher {
    fn batch(&self, items: Vec<ImageItem>, device: &B::Device) -> ImageBatch<B> {
        let batch_size = items.len();
        let ImageSettings { height, width } = self.size;
        let mut pixels = Vec::with_capacity(batch_size * CHANNELS * height * width);
        let mut labels = Vec::with_capacity(batch_size);

        for item in items {
            pixels.extend_from_slice(&item.pixels);
            labels.push(item.label as i64);
        }

        let images = Tensor::<B, 4>::from_data(
            TensorData::new(pixels, [batch_size, CHANNELS, height, width]),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [batch_size]), device);

        ImageBatch { images, targets }
    }
}

/// 学習用ローダーの型
pub type TrainLoader<B> = Arc<dyn DataLoader<B, ImageBatch<B>>>;
/// 検証用ローダーの型（勾配なしのバックエンド）
pub type ValidLoader<B> =
    Arc<dyn DataLoader<<B as AutodiffBackend>::InnerBackend, ImageBatch<<B as AutodiffBackend>::InnerBackend>>>;

/// 分割済みデータセット
pub struct TrainValSplits<B: AutodiffBackend> {
    pub train: TrainLoader<B>,
    pub valid: ValidLoader<B>,
    pub class_names: Vec<String>,
    pub num_train: usize,
    pub num_valid: usize,
}

/// ディレクトリから学習用・検証用のデータローダーを構築
pub fn configure_train_val<B: AutodiffBackend>(
    data_dir: &Path,
    size: ImageSettings,
    settings: &TrainingSettings,
    device: &B::Device,
) -> Result<TrainValSplits<B>> {
    let folder = ImageFolder::discover(data_dir)?;
    let (train_samples, valid_samples) = folder.split(settings.validation_split, settings.seed);
    let num_train = train_samples.len();
    let num_valid = valid_samples.len();

    tracing::info!("学習データ: {} 枚", num_train);
    tracing::info!("検証データ: {} 枚", num_valid);

    let train_builder = DataLoaderBuilder::new(ImageBatcher::new(size))
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .set_device(device.clone());
    let train: TrainLoader<B> = if settings.cache_train {
        tracing::info!("学習データをメモリにキャッシュしています...");
        train_builder.build(cache_samples(&train_samples, size)?)
    } else {
        train_builder.build(LazyImageDataset::new(train_samples, size))
    };

    let valid: ValidLoader<B> = DataLoaderBuilder::new(ImageBatcher::new(size))
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .set_device(device.clone())
        .build(LazyImageDataset::new(valid_samples, size));

    Ok(TrainValSplits {
        train,
        valid,
        class_names: folder.class_names().to_vec(),
        num_train,
        num_valid,
    })
}

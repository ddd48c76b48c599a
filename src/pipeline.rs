//! 学習から推論までの一連の処理
//!
//! 1. データセットを取得してキャッシュに展開
//! 2. 学習用・検証用に分割して学習
//! 3. tar.gz で保存し、登録簿に記録
//! 4. 指定URLの画像で推論して結果を表示

use anyhow::{Context, Result};
use burn::tensor::backend::{AutodiffBackend, Backend};
use std::path::{Path, PathBuf};

use crate::dataset::{fetch_dataset, list_images};
use crate::ml::{model_to_bytes, predict, train_model, InferenceEngine, Prediction, TrainedClassifier};
use crate::model::{
    default_model_name, print_metadata_info, save_model_with_metadata, AppConfig, ModelMetadata,
};
use crate::registry::{ModelStore, NewModelRecord};

/// 学習処理の結果
pub struct TrainingReport<B: Backend> {
    pub trained: TrainedClassifier<B>,
    pub metadata: ModelMetadata,
    pub model_path: PathBuf,
    /// 登録簿で採番されたID
    pub model_id: i64,
    pub prediction: Prediction,
}

/// データセット取得から推論までを実行
///
/// `image_url` が `None` なら設定の推論用URLを使う。
pub fn run_training<B: AutodiffBackend>(
    config: &AppConfig,
    image_url: Option<&str>,
    device: B::Device,
) -> Result<TrainingReport<B::InnerBackend>> {
    let data_dir = fetch_dataset(&config.dataset)?;
    let images = list_images(&data_dir)?;
    println!("データセット内の画像数: {}", images.len());

    let trained = train_model::<B>(&data_dir, config.image, &config.training, device.clone())?;

    let metadata = ModelMetadata::new(
        default_model_name(chrono::Local::now()),
        trained.class_names.clone(),
        config.image,
        &config.training,
        trained.evaluation.map(|e| e.accuracy),
        config.dataset.url.clone(),
    );
    let (model_path, model_id) = persist_model(&trained, &metadata, config)?;

    let url = image_url.unwrap_or(&config.prediction.image_url);
    let prediction = predict(&trained.model, &trained.class_names, url, config.image, &device)?;
    println!("{}", prediction);

    Ok(TrainingReport {
        trained,
        metadata,
        model_path,
        model_id,
        prediction,
    })
}

/// モデルを保存して登録簿に記録
pub fn persist_model<B: Backend>(
    trained: &TrainedClassifier<B>,
    metadata: &ModelMetadata,
    config: &AppConfig,
) -> Result<(PathBuf, i64)> {
    let binary = model_to_bytes(&trained.model)?;
    let model_path =
        save_model_with_metadata(&config.storage.model_dir.join(&metadata.name), metadata, &binary)?;

    let store = ModelStore::new(&config.storage.database_path);
    store.init()?;
    let model_id = store
        .session()?
        .insert_model(&NewModelRecord::from_metadata(metadata, &model_path))
        .context("モデルを登録簿に記録できません")?;
    tracing::info!("モデルを登録しました: id={} ({})", model_id, metadata.name);

    Ok((model_path, model_id))
}

/// 保存済みモデルで推論
pub fn run_prediction<B: Backend>(
    model_path: &Path,
    image_url: &str,
    device: B::Device,
) -> Result<Prediction> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    print_metadata_info(engine.metadata());
    let prediction = engine.classify_url(image_url)?;
    println!("{}", prediction);
    Ok(prediction)
}

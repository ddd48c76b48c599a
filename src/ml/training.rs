//! モデル学習

use anyhow::{Context, Result};
use burn::{
    data::dataloader::DataLoader,
    module::{AutodiffModule, Module},
    optim::AdamConfig,
    tensor::backend::{AutodiffBackend, Backend},
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, LearningStrategy, TrainOutput, TrainStep,
        ValidStep,
    },
};
use std::path::Path;
use std::sync::Arc;

use crate::dataset::partition::{configure_train_val, ImageBatch};
use crate::ml::ModelConfig;
use crate::ml::SceneClassifier;
use crate::model::config::{ImageSettings, TrainingSettings};

/// Adamのイプシロン
const ADAM_EPSILON: f32 = 1e-7;

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<ImageBatch<B>, ClassificationOutput<B>> for SceneClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<ImageBatch<B>, ClassificationOutput<B>> for SceneClassifier<B> {
    fn step(&self, batch: ImageBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 検証データでの評価結果
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub accuracy: f64,
    pub num_items: usize,
}

/// 学習結果
pub struct TrainedClassifier<B: Backend> {
    /// 推論用（勾配なし）のモデル
    pub model: SceneClassifier<B>,
    /// クラス名（インデックスはモデル出力と対応）
    pub class_names: Vec<String>,
    /// 学習後の検証データでの評価（検証データが空なら `None`）
    pub evaluation: Option<Evaluation>,
}

/// モデル学習を実行
///
/// データセットの分割・モデル構築・学習・最終評価までを行う。
/// エポックごとの指標は burn の Learner が出力する。
pub fn train_model<B: AutodiffBackend>(
    data_dir: &Path,
    size: ImageSettings,
    settings: &TrainingSettings,
    device: B::Device,
) -> Result<TrainedClassifier<B::InnerBackend>> {
    let splits = configure_train_val::<B>(data_dir, size, settings, &device)?;
    if splits.num_train == 0 {
        anyhow::bail!("学習データが0枚です");
    }

    let model_config = ModelConfig::from_image_settings(splits.class_names.len(), size);
    model_config.validate()?;

    tracing::info!(
        "モデル設定: {} クラス ({}), 入力サイズ: {}x{}",
        splits.class_names.len(),
        splits.class_names.join(", "),
        size.width,
        size.height
    );

    let model = model_config.init::<B>(&device);
    print_summary(&model, &model_config);

    // アーティファクトディレクトリ（学習ログ用、終了後に削除）
    let artifact_dir = std::env::temp_dir().join(format!("scene_classifier_training_{}", std::process::id()));
    std::fs::create_dir_all(&artifact_dir).with_context(|| {
        format!("作業ディレクトリを作成できません: {}", artifact_dir.display())
    })?;
    let artifact_dir_str = artifact_dir.to_string_lossy().to_string();

    tracing::info!(
        "学習を開始します: エポック数 {}, バッチサイズ {}, 学習率 {}",
        settings.num_epochs,
        settings.batch_size,
        settings.learning_rate
    );

    let learner = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(settings.num_epochs)
        .summary()
        .build(
            model,
            AdamConfig::new().with_epsilon(ADAM_EPSILON).init(),
            settings.learning_rate,
        );

    let valid_loader = splits.valid.clone();
    let model_trained = learner.fit(splits.train, splits.valid);
    tracing::info!("学習が完了しました");

    std::fs::remove_dir_all(&artifact_dir).ok();

    let model = model_trained.model.valid();
    let evaluation = if splits.num_valid > 0 {
        let evaluation = evaluate(&model, &valid_loader);
        tracing::info!(
            "検証データでの評価: loss {:.4}, accuracy {:.2}% ({} 枚)",
            evaluation.loss,
            evaluation.accuracy * 100.0,
            evaluation.num_items
        );
        Some(evaluation)
    } else {
        tracing::warn!("検証データが0枚のため評価をスキップします");
        None
    };

    Ok(TrainedClassifier {
        model,
        class_names: splits.class_names,
        evaluation,
    })
}

/// 検証データで損失と正解率を計算
pub fn evaluate<B: Backend>(
    model: &SceneClassifier<B>,
    loader: &Arc<dyn DataLoader<B, ImageBatch<B>>>,
) -> Evaluation {
    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    let mut num_items = 0usize;

    for batch in loader.iter() {
        let output = model.forward_classification(batch.images, batch.targets);
        let [batch_size, _] = output.output.dims();
        let predictions = output.output.argmax(1).squeeze::<1>(1);
        let matches = predictions.equal(output.targets).int().sum();

        loss_sum += scalar_f64(output.loss.into_data()) * batch_size as f64;
        correct += scalar_f64(matches.into_data()) as usize;
        num_items += batch_size;
    }

    if num_items == 0 {
        return Evaluation::default();
    }
    Evaluation {
        loss: loss_sum / num_items as f64,
        accuracy: correct as f64 / num_items as f64,
        num_items,
    }
}

fn scalar_f64(data: burn::tensor::TensorData) -> f64 {
    data.convert::<f64>()
        .to_vec::<f64>()
        .ok()
        .and_then(|values| values.first().copied())
        .unwrap_or(0.0)
}

/// ネットワーク構造の概要を表示
pub fn print_summary<B: Backend>(model: &SceneClassifier<B>, config: &ModelConfig) {
    let (h, w) = config.feature_map_size();
    println!("=== モデル構造 ===");
    println!("{}", model);
    println!("入力: 3 x {} x {}", config.image_height, config.image_width);
    println!("特徴マップ (3回のプーリング後): 64 x {} x {}", h, w);
    println!("Flatten後の特徴次元: {}", config.flattened_features());
    println!("出力クラス数: {}", config.num_classes);
    println!("総パラメータ数: {}", model.num_params());
    println!("==================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::folder::test_support::write_class_images;
    use burn::backend::ndarray::NdArrayDevice;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn evaluate_reports_accuracy_in_unit_range() {
        let dir = tempfile::tempdir().unwrap();
        write_class_images(dir.path(), "cantina", 5, [250, 10, 10]);
        write_class_images(dir.path(), "quadra", 5, [10, 250, 10]);
        let size = ImageSettings { height: 8, width: 8 };
        let settings = TrainingSettings {
            batch_size: 2,
            num_workers: 0,
            validation_split: 0.4,
            ..TrainingSettings::default()
        };
        let device = NdArrayDevice::Cpu;
        let splits = configure_train_val::<TestBackend>(dir.path(), size, &settings, &device).unwrap();
        let model = ModelConfig::from_image_settings(2, size).init::<NdArray>(&device);

        let evaluation = evaluate(&model, &splits.valid);

        assert_eq!(evaluation.num_items, 4);
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert!(evaluation.loss.is_finite());
    }

    #[test]
    fn trains_one_epoch_on_cats_and_dogs() {
        let dir = tempfile::tempdir().unwrap();
        write_class_images(dir.path(), "dogs", 5, [240, 240, 240]);
        write_class_images(dir.path(), "cats", 5, [10, 10, 10]);
        let size = ImageSettings { height: 8, width: 8 };
        let settings = TrainingSettings {
            num_epochs: 1,
            batch_size: 4,
            num_workers: 0,
            ..TrainingSettings::default()
        };
        let trained =
            train_model::<TestBackend>(dir.path(), size, &settings, NdArrayDevice::Cpu).unwrap();

        assert_eq!(trained.class_names, vec!["cats", "dogs"]);
        let evaluation = trained.evaluation.unwrap();
        assert_eq!(evaluation.num_items, 2);
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert!(evaluation.loss.is_finite());

        let logits = trained
            .model
            .forward(burn::tensor::Tensor::<NdArray, 4>::zeros([1, 3, 8, 8], &NdArrayDevice::Cpu));
        assert_eq!(logits.dims(), [1, 2]);
    }

    #[test]
    fn train_step_produces_gradients() {
        let device = NdArrayDevice::Cpu;
        let size = ImageSettings { height: 8, width: 8 };
        let model = ModelConfig::from_image_settings(2, size).init::<TestBackend>(&device);
        let batch = ImageBatch {
            images: burn::tensor::Tensor::<TestBackend, 4>::ones([2, 3, 8, 8], &device),
            targets: burn::tensor::Tensor::<TestBackend, 1, burn::tensor::Int>::from_ints([0, 1], &device),
        };

        let output = TrainStep::step(&model, batch);
        assert_eq!(output.item.output.dims(), [2, 2]);
    }
}

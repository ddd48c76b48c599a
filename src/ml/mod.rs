pub mod ml_model;
pub mod training;
pub mod inference;

pub use ml_model::{ModelConfig, SceneClassifier};
pub use training::{evaluate, train_model, Evaluation, TrainedClassifier};
pub use inference::{model_to_bytes, predict, InferenceEngine, Prediction};

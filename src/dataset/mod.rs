//! データセットの取得と前処理

pub mod acquisition;
pub mod folder;
pub mod preprocess;
#[cfg(feature = "ml")]
pub mod partition;

pub use acquisition::{fetch_dataset, list_images};
pub use folder::{ImageFolder, ImageSample};

//! 画像シーン分類器
//!
//! 画像フォルダ形式のデータセットを取得してCNNを学習し、学習済みモデルを
//! 保存・登録する。登録済みモデルは HTTP API から一覧できる。

pub mod api;
pub mod dataset;
pub mod http_client;
pub mod logging;
pub mod model;
pub mod registry;

#[cfg(feature = "ml")]
pub mod ml;
#[cfg(feature = "ml")]
pub mod pipeline;

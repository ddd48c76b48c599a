//! アプリケーション設定管理モジュール
//!
//! 計算デバイス、データセット取得元、画像サイズ、学習パラメータなどを
//! JSON形式で保存・読み込みします。各処理にはこの設定を明示的に渡します。

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

/// 推論テスト用画像のデフォルト取得元
pub const DEFAULT_PREDICTION_IMAGE_URL: &str =
    "https://drive.google.com/uc?export=download&id=1I3uzeJHQ0T0_DPKMs0n2S6K9ulZuF3gX";

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// データセット取得設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSettings {
    /// アーカイブのURL（tar / tar.gz / zip）
    ///
    /// キャッシュが既に展開済みなら未設定でもよい
    #[serde(default)]
    pub url: Option<String>,
    /// キャッシュ名（展開後のディレクトリ名を兼ねる）
    pub cache_name: String,
    /// キャッシュディレクトリ（未指定ならOS標準のキャッシュ領域）
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for DatasetSettings {
    fn default() -> Self {
        Self {
            url: None,
            cache_name: "imagens_escola".to_string(),
            cache_dir: None,
        }
    }
}

/// 入力画像サイズ
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSettings {
    /// 高さ（ピクセル）
    pub height: usize,
    /// 幅（ピクセル）
    pub width: usize,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            height: 180,
            width: 260,
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 学習率
    pub learning_rate: f64,
    /// 分割・シャッフル用のランダムシード
    pub seed: u64,
    /// 検証データの割合
    pub validation_split: f64,
    /// データローダーのワーカー数（先読み）
    pub num_workers: usize,
    /// 学習データを事前にデコードしてメモリに保持するか
    #[serde(default = "default_cache_train")]
    pub cache_train: bool,
}

fn default_cache_train() -> bool {
    true
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 7,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 123,
            validation_split: 0.2,
            num_workers: 2,
            cache_train: true,
        }
    }
}

/// 推論設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionSettings {
    /// コマンドラインで指定がない場合に使う画像URL
    pub image_url: String,
}

impl Default for PredictionSettings {
    fn default() -> Self {
        Self {
            image_url: DEFAULT_PREDICTION_IMAGE_URL.to_string(),
        }
    }
}

/// モデル保存先とレジストリDB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// 学習済みモデル（tar.gz）の保存ディレクトリ
    pub model_dir: PathBuf,
    /// モデルレジストリ（SQLite）のパス
    pub database_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            database_path: PathBuf::from("models.db"),
        }
    }
}

/// APIサーバー設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// 待ち受けアドレス
    pub bind_addr: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8000".to_string(),
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub dataset: DatasetSettings,
    #[serde(default)]
    pub image: ImageSettings,
    #[serde(default)]
    pub training: TrainingSettings,
    #[serde(default)]
    pub prediction: PredictionSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub server: ServerSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("config.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("設定ファイルを読み込めません: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("設定ファイルの形式が不正です: {}", path.display()))?;
        Ok(config)
    }

    /// 指定パスから設定を読み込む、存在しない・壊れている場合はデフォルト設定を返す
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if path.exists() {
            match Self::load(path) {
                Ok(config) => {
                    tracing::info!("設定ファイルを読み込みました: {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "設定ファイルの読み込みに失敗しました ({}): {:#}。デフォルト設定を使用します",
                        path.display(),
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("設定ファイルが存在しません。デフォルト設定を使用します");
            Self::default()
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の整合性を検証
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.image.height == 0 || self.image.width == 0 {
            bail!(
                "画像サイズが不正です: {}x{}",
                self.image.width,
                self.image.height
            );
        }
        if self.training.batch_size == 0 {
            bail!("バッチサイズは1以上を指定してください");
        }
        if self.training.num_epochs == 0 {
            bail!("エポック数は1以上を指定してください");
        }
        let split = self.training.validation_split;
        if !(0.0..1.0).contains(&split) {
            bail!("検証データの割合は0以上1未満で指定してください: {}", split);
        }
        if self.dataset.cache_name.trim().is_empty() {
            bail!("データセットのキャッシュ名が空です");
        }
        if let Some(url) = &self.dataset.url {
            validate_http_url(url)?;
        }
        validate_http_url(&self.prediction.image_url)?;
        self.server
            .bind_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("待ち受けアドレスが不正です: {}", self.server.bind_addr))?;
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== アプリケーション設定 ===");
        println!("計算デバイス: {}", self.device_type);
        println!(
            "データセットURL: {}",
            self.dataset.url.as_deref().unwrap_or("(未設定)")
        );
        println!("キャッシュ名: {}", self.dataset.cache_name);
        println!("入力サイズ: {}x{}", self.image.width, self.image.height);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.training.num_epochs);
        println!("バッチサイズ: {}", self.training.batch_size);
        println!("学習率: {}", self.training.learning_rate);
        println!("シード: {}", self.training.seed);
        println!("検証データ割合: {}", self.training.validation_split);
        println!("\n--- 保存先 ---");
        println!("モデル: {}", self.storage.model_dir.display());
        println!("レジストリ: {}", self.storage.database_path.display());
        println!("========================\n");
    }
}

/// http / https のURLか検証
pub fn validate_http_url(raw: &str) -> anyhow::Result<Url> {
    let parsed = Url::parse(raw).with_context(|| format!("URLが不正です: {}", raw))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => bail!("対応していないスキームです ({}): {}", other, raw),
    }
}

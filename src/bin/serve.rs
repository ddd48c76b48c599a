//! 登録済みモデル一覧APIサーバー
//!
//! ```text
//! serve [--config <path>]
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;

use scene_classifier::api::{router, AppState};
use scene_classifier::logging;
use scene_classifier::model::AppConfig;
use scene_classifier::registry::ModelStore;

fn config_path(args: &[String]) -> Result<PathBuf> {
    match args {
        [] => Ok(AppConfig::default_path()),
        [flag, path] if flag == "--config" => Ok(PathBuf::from(path)),
        _ => bail!("Usage: serve [--config <path>]"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = logging::init() {
        eprintln!("ログの初期化に失敗しました: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = AppConfig::load_or_default(config_path(&args)?);
    config.validate()?;

    let store = ModelStore::new(&config.storage.database_path);
    store.init()?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr)
        .await
        .with_context(|| format!("待ち受けを開始できません: {}", config.server.bind_addr))?;
    tracing::info!(
        "モデル一覧APIを起動しました: http://{}/v1/models/ (DB: {})",
        config.server.bind_addr,
        store.path().display()
    );

    axum::serve(listener, router(AppState::new(store)))
        .await
        .context("APIサーバーが異常終了しました")?;
    Ok(())
}

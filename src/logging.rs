//! ログ出力の初期化
//!
//! 標準エラー出力へ書き出すグローバルな tracing サブスクライバを設定する。
//! レベルは `RUST_LOG` で指定でき、未指定なら `info`。

use std::sync::OnceLock;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "info";

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// ログ初期化のエラー
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(tracing::subscriber::SetGlobalDefaultError),
}

/// グローバルなサブスクライバを設定する
///
/// 2回目以降の呼び出しは何もしない。
pub fn init() -> Result<(), LoggingError> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let subscriber = Registry::default()
        .with(build_env_filter())
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr));
    tracing::subscriber::set_global_default(subscriber).map_err(LoggingError::SetGlobal)?;
    let _ = INITIALIZED.set(());

    tracing::debug!("Logging initialized");
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

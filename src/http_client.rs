//! HTTPダウンロード共通処理
//!
//! タイムアウト付きの共有エージェントと、サイズ上限付きのレスポンス読み込みを提供します。
//! リトライは行わず、失敗はそのまま呼び出し元へ返します。

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// データセットアーカイブの最大サイズ
pub const MAX_ARCHIVE_BYTES: usize = 2 * 1024 * 1024 * 1024;
/// 推論用画像の最大サイズ
pub const MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;

/// タイムアウト設定済みの共有エージェント
pub fn agent() -> &'static ureq::Agent {
    static AGENT: OnceLock<ureq::Agent> = OnceLock::new();
    AGENT.get_or_init(|| {
        ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .timeout_write(WRITE_TIMEOUT)
            .build()
    })
}

/// URLの内容をメモリに読み込む
pub fn fetch_bytes(url: &str, max_bytes: usize) -> Result<Vec<u8>> {
    let response = agent()
        .get(url)
        .call()
        .with_context(|| format!("ダウンロードに失敗しました: {}", url))?;
    read_response_bytes(response, max_bytes)
        .with_context(|| format!("レスポンスの読み込みに失敗しました: {}", url))
}

/// URLの内容をファイルに保存する
///
/// `<dest>.part` に書き込んでから名前を変更するため、途中で失敗しても
/// 不完全なファイルが `dest` に残ることはない。
pub fn download_to_path(url: &str, dest: &Path, max_bytes: usize) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("ディレクトリを作成できません: {}", parent.display()))?;
    }
    let part = part_path(dest);
    let response = agent()
        .get(url)
        .call()
        .with_context(|| format!("ダウンロードに失敗しました: {}", url))?;

    let result = (|| -> Result<()> {
        let file = File::create(&part)
            .with_context(|| format!("ファイルを作成できません: {}", part.display()))?;
        let mut writer = BufWriter::new(file);
        copy_response_to_writer(response, &mut writer, max_bytes)?;
        writer.flush()?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&part);
        return Err(err.context(format!("ダウンロードを中断しました: {}", url)));
    }

    fs::rename(&part, dest)
        .with_context(|| format!("ファイル名を変更できません: {}", dest.display()))?;
    tracing::info!("ダウンロード完了: {} -> {}", url, dest.display());
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// サイズ上限付きでレスポンスをメモリに読み込む
pub(crate) fn read_response_bytes(response: ureq::Response, max_bytes: usize) -> Result<Vec<u8>> {
    check_content_length(&response, max_bytes)?;
    let reader = response.into_reader();
    let mut limited = reader.take(max_bytes as u64 + 1);
    let mut bytes = Vec::new();
    limited.read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        bail!("レスポンスが上限 {} バイトを超えました", max_bytes);
    }
    Ok(bytes)
}

/// サイズ上限付きでレスポンスを書き出す
pub(crate) fn copy_response_to_writer(
    response: ureq::Response,
    writer: &mut impl Write,
    max_bytes: usize,
) -> Result<()> {
    check_content_length(&response, max_bytes)?;
    let reader = response.into_reader();
    let mut limited = reader.take(max_bytes as u64 + 1);
    let mut total = 0usize;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = match limited.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        total += read;
        if total > max_bytes {
            bail!("レスポンスが上限 {} バイトを超えました", max_bytes);
        }
        writer.write_all(&buf[..read])?;
    }
    Ok(())
}

fn check_content_length(response: &ureq::Response, max_bytes: usize) -> Result<()> {
    let Some(length) = response.header("Content-Length") else {
        return Ok(());
    };
    let Ok(length) = length.parse::<u64>() else {
        return Ok(());
    };
    if length > max_bytes as u64 {
        bail!("レスポンスが大きすぎます: {} バイト", length);
    }
    Ok(())
}

//! データセットの取得と展開
//!
//! アーカイブをダウンロードしてキャッシュディレクトリに展開します。
//! 展開済みディレクトリが既にあればネットワークには一切アクセスしません。
//!
//! キャッシュ構成:
//! - `<cache_dir>/<cache_name>.tar.gz` - ダウンロードしたアーカイブ
//! - `<cache_dir>/<cache_name>/`       - 展開先（クラスごとのサブディレクトリ）

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::Archive;

use crate::http_client;
use crate::model::config::{validate_http_url, DatasetSettings};

/// アーカイブ形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Tar,
    Zip,
}

impl ArchiveFormat {
    /// 先頭バイトから形式を判定
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(&[0x1f, 0x8b]) {
            ArchiveFormat::TarGz
        } else if header.starts_with(b"PK\x03\x04") {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::Tar
        }
    }
}

/// キャッシュディレクトリを決定
///
/// 設定で指定がなければOS標準のキャッシュ領域を使う。
pub fn resolve_cache_dir(settings: &DatasetSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.cache_dir {
        return Ok(dir.clone());
    }
    let base = directories::BaseDirs::new()
        .ok_or_else(|| anyhow!("キャッシュディレクトリを特定できません"))?;
    Ok(base.cache_dir().join("scene_classifier").join("datasets"))
}

/// データセットを取得して展開先ディレクトリを返す
pub fn fetch_dataset(settings: &DatasetSettings) -> Result<PathBuf> {
    let cache_dir = resolve_cache_dir(settings)?;
    let data_dir = cache_dir.join(&settings.cache_name);

    if data_dir.is_dir() {
        tracing::info!("キャッシュ済みのデータセットを使用します: {}", data_dir.display());
        return Ok(data_dir);
    }

    fs::create_dir_all(&cache_dir)
        .with_context(|| format!("キャッシュディレクトリを作成できません: {}", cache_dir.display()))?;

    let archive_path = cache_dir.join(format!("{}.tar.gz", settings.cache_name));
    if !archive_path.is_file() {
        let url = settings.url.as_deref().ok_or_else(|| {
            anyhow!(
                "データセットURLが未設定で、キャッシュ {} も存在しません",
                data_dir.display()
            )
        })?;
        validate_http_url(url)?;
        tracing::info!("データセットをダウンロードします: {}", url);
        http_client::download_to_path(url, &archive_path, http_client::MAX_ARCHIVE_BYTES)?;
    }

    if let Err(err) = extract_archive(&archive_path, &cache_dir) {
        // 展開途中のディレクトリとアーカイブは残さない
        if data_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&data_dir) {
                tracing::warn!("展開途中のディレクトリを削除できません {}: {}", data_dir.display(), e);
            }
        }
        if let Err(e) = fs::remove_file(&archive_path) {
            tracing::warn!("アーカイブを削除できません {}: {}", archive_path.display(), e);
        }
        return Err(err);
    }

    if !data_dir.is_dir() {
        bail!(
            "展開後に {} が見つかりません（アーカイブの最上位ディレクトリ名が '{}' ではない可能性があります）",
            data_dir.display(),
            settings.cache_name
        );
    }
    Ok(data_dir)
}

/// アーカイブを指定ディレクトリへ展開
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let mut file = File::open(archive_path)
        .with_context(|| format!("アーカイブを開けません: {}", archive_path.display()))?;
    let mut header = [0u8; 4];
    let read = file.read(&mut header)?;
    file.seek(SeekFrom::Start(0))?;
    let format = ArchiveFormat::detect(&header[..read]);

    tracing::info!(
        "アーカイブを展開します ({:?}): {} -> {}",
        format,
        archive_path.display(),
        dest.display()
    );

    match format {
        ArchiveFormat::TarGz => Archive::new(GzDecoder::new(BufReader::new(file)))
            .unpack(dest)
            .context("tar.gzの展開に失敗しました")?,
        ArchiveFormat::Tar => Archive::new(BufReader::new(file))
            .unpack(dest)
            .context("tarの展開に失敗しました")?,
        ArchiveFormat::Zip => zip::ZipArchive::new(BufReader::new(file))
            .context("zipを読み込めません")?
            .extract(dest)
            .context("zipの展開に失敗しました")?,
    }
    Ok(())
}

/// ルートから2階層下のエントリ（`*/*`）を列挙する
///
/// クラスごとのサブディレクトリにある画像の一覧になる。
pub fn list_images(data_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in fs::read_dir(data_dir)
        .with_context(|| format!("ディレクトリを読み込めません: {}", data_dir.display()))?
    {
        let class_dir = entry?.path();
        if !class_dir.is_dir() {
            continue;
        }
        for item in fs::read_dir(&class_dir)? {
            images.push(item?.path());
        }
    }
    images.sort();
    Ok(images)
}

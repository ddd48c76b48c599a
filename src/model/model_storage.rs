//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力サイズ、学習設定など）
//! - model.bin       - モデルの重み（バイナリ）

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 保存先のパスを `.tar.gz` で終わる形に揃える
pub fn archive_path(output_path: &Path) -> PathBuf {
    let name = output_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.ends_with(".tar.gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_file_name(format!("{}.tar.gz", name))
    }
}

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 実際に書き込んだパスを返す。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = archive_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;
    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    tar_builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .context("Failed to finalize tar.gz archive")?;

    tracing::info!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, bytes: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, bytes)
        .with_context(|| format!("Failed to add {} to tar", name))
}

/// アーカイブ内の指定エントリを順に読み出す
///
/// `wanted` に含まれる名前のエントリだけを `(名前, 内容)` で返す。
fn read_entries(tar_gz_path: &Path, wanted: &[&str]) -> Result<Vec<(String, Vec<u8>)>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    let mut archive = Archive::new(GzDecoder::new(tar_gz_file));

    let mut found = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().to_string();
        if wanted.contains(&name.as_str()) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            found.push((name, buffer));
        }
    }
    Ok(found)
}

fn parse_metadata(bytes: &[u8]) -> Result<ModelMetadata> {
    let json_str = std::str::from_utf8(bytes).context("metadata.json is not valid UTF-8")?;
    ModelMetadata::from_json_string(json_str)
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let entries = read_entries(tar_gz_path, &[METADATA_ENTRY])?;
    let (_, bytes) = entries
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("metadata.json not found in tar.gz archive"))?;
    parse_metadata(&bytes)
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    read_entries(tar_gz_path, &[MODEL_ENTRY])?
        .into_iter()
        .next()
        .map(|(_, bytes)| bytes)
        .ok_or_else(|| anyhow!("model.bin not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut metadata = None;
    let mut binary = None;
    for (name, bytes) in read_entries(tar_gz_path, &[METADATA_ENTRY, MODEL_ENTRY])? {
        if name == METADATA_ENTRY {
            metadata = Some(parse_metadata(&bytes)?);
        } else {
            binary = Some(bytes);
        }
    }

    match (metadata, binary) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("モデル名: {}", metadata.name);
    println!("クラス: {}", metadata.class_names.join(", "));
    println!("入力サイズ: {}x{}", metadata.image_width, metadata.image_height);
    println!(
        "学習設定: エポック数 {}, バッチサイズ {}, 学習率 {}, シード {}",
        metadata.num_epochs, metadata.batch_size, metadata.learning_rate, metadata.seed
    );
    match metadata.val_accuracy {
        Some(accuracy) => println!("検証正解率: {:.2}%", accuracy * 100.0),
        None => println!("検証正解率: -"),
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

//! クラスごとのディレクトリから画像を収集し、学習用と検証用に分割

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// 対象とする画像拡張子
const IMAGE_EXTENSIONS: [&str; 5] = ["bmp", "gif", "jpeg", "jpg", "png"];

/// 画像サンプル（パスとクラスID）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: usize,
}

/// ディレクトリ構成から読み込んだデータセット
///
/// `root/<クラス名>/<画像>` の構成を前提とし、クラス名は名前順に並べる。
/// クラスIDは `class_names` のインデックスと一致する。
#[derive(Clone, Debug)]
pub struct ImageFolder {
    samples: Vec<ImageSample>,
    class_names: Vec<String>,
}

impl ImageFolder {
    /// ディレクトリを走査してサンプルを収集
    pub fn discover(root: &Path) -> Result<Self> {
        let mut class_names = Vec::new();
        for entry in fs::read_dir(root)
            .with_context(|| format!("データセットディレクトリを読み込めません: {}", root.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                let class_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| anyhow!("不正なディレクトリ名です: {}", path.display()))?
                    .to_string();
                class_names.push(class_name);
            }
        }
        class_names.sort();

        if class_names.is_empty() {
            bail!("クラスディレクトリが見つかりません: {}", root.display());
        }

        let mut samples = Vec::new();
        for (label, class_name) in class_names.iter().enumerate() {
            let mut files = Vec::new();
            collect_images(&root.join(class_name), &mut files)?;
            files.sort();
            samples.extend(files.into_iter().map(|path| ImageSample { path, label }));
        }

        if samples.is_empty() {
            bail!("画像が1枚も見つかりません: {}", root.display());
        }

        tracing::info!(
            "{} クラスから {} 枚の画像を読み込みました",
            class_names.len(),
            samples.len()
        );
        for (i, name) in class_names.iter().enumerate() {
            let count = samples.iter().filter(|s| s.label == i).count();
            tracing::debug!("  クラス {}: {} ({} 枚)", i, name, count);
        }

        Ok(Self {
            samples,
            class_names,
        })
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// 学習用と検証用に分割
    ///
    /// 全サンプルを `seed` で初期化した乱数でシャッフルし、末尾
    /// `floor(validation_split * n)` 件を検証用、残りをすべて学習用とする。
    pub fn split(&self, validation_split: f64, seed: u64) -> (Vec<ImageSample>, Vec<ImageSample>) {
        let mut shuffled = self.samples.clone();
        let mut rng = StdRng::seed_from_u64(seed);
        shuffled.shuffle(&mut rng);

        let total = shuffled.len();
        let num_val = ((validation_split * total as f64) as usize).min(total);
        let num_train = total - num_val;

        let validation = shuffled.split_off(num_train);
        (shuffled, validation)
    }
}

fn collect_images(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .with_context(|| format!("ディレクトリを読み込めません: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_images(&path, out)?;
        } else if is_image_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

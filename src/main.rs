//! 学習・推論コマンド
//!
//! ```text
//! scene_classifier [--config <path>] [--cpu] train [--dataset-url <url>] [--image-url <url>]
//! scene_classifier [--config <path>] [--cpu] predict <model.tar.gz> [image_url]
//! ```

use anyhow::{bail, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use std::path::PathBuf;

use scene_classifier::model::{AppConfig, DeviceType};
use scene_classifier::{logging, pipeline};

const USAGE: &str = "Usage:
  scene_classifier [--config <path>] [--cpu] train [--dataset-url <url>] [--image-url <url>]
  scene_classifier [--config <path>] [--cpu] predict <model.tar.gz> [image_url]";

enum Command {
    Train {
        dataset_url: Option<String>,
        image_url: Option<String>,
    },
    Predict {
        model_path: PathBuf,
        image_url: Option<String>,
    },
}

struct Cli {
    config_path: PathBuf,
    force_cpu: bool,
    command: Command,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut config_path = AppConfig::default_path();
    let mut force_cpu = false;
    let mut rest = args.iter();
    let mut positional = Vec::new();
    let mut dataset_url = None;
    let mut image_url = None;

    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--config" => match rest.next() {
                Some(path) => config_path = PathBuf::from(path),
                None => bail!("--config にはパスが必要です"),
            },
            "--cpu" => force_cpu = true,
            "--dataset-url" => match rest.next() {
                Some(url) => dataset_url = Some(url.clone()),
                None => bail!("--dataset-url にはURLが必要です"),
            },
            "--image-url" => match rest.next() {
                Some(url) => image_url = Some(url.clone()),
                None => bail!("--image-url にはURLが必要です"),
            },
            other if other.starts_with("--") => bail!("不明なオプションです: {}", other),
            other => positional.push(other.to_string()),
        }
    }

    let command = match positional.first().map(String::as_str) {
        Some("train") | None => Command::Train {
            dataset_url,
            image_url,
        },
        Some("predict") => {
            let Some(model_path) = positional.get(1) else {
                bail!("predict にはモデルファイルのパスが必要です");
            };
            Command::Predict {
                model_path: PathBuf::from(model_path),
                image_url: positional.get(2).cloned().or(image_url),
            }
        }
        Some(other) => bail!("不明なコマンドです: {}", other),
    };

    Ok(Cli {
        config_path,
        force_cpu,
        command,
    })
}

fn main() {
    if let Err(e) = logging::init() {
        eprintln!("ログの初期化に失敗しました: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", USAGE);
        return;
    }

    if let Err(e) = run(&args) {
        tracing::error!("{:#}", e);
        eprintln!("エラー: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let cli = parse_args(args)?;
    let mut config = AppConfig::load_or_default(&cli.config_path);
    if cli.force_cpu {
        config.device_type = DeviceType::Cpu;
    }

    match cli.command {
        Command::Train {
            dataset_url,
            image_url,
        } => {
            if dataset_url.is_some() {
                config.dataset.url = dataset_url;
            }
            if let Some(url) = image_url {
                config.prediction.image_url = url;
            }
            config.validate()?;
            config.display();

            tracing::info!("計算デバイス: {}", config.device_type);
            let report = match config.device_type {
                DeviceType::Wgpu => {
                    let report = pipeline::run_training::<Autodiff<Wgpu>>(
                        &config,
                        None,
                        WgpuDevice::default(),
                    )?;
                    (report.model_id, report.model_path)
                }
                DeviceType::Cpu => {
                    let report = pipeline::run_training::<Autodiff<NdArray>>(
                        &config,
                        None,
                        NdArrayDevice::Cpu,
                    )?;
                    (report.model_id, report.model_path)
                }
            };
            println!("モデルを保存しました: {} (id={})", report.1.display(), report.0);
        }
        Command::Predict {
            model_path,
            image_url,
        } => {
            let image_url = image_url.unwrap_or_else(|| config.prediction.image_url.clone());
            match config.device_type {
                DeviceType::Wgpu => {
                    pipeline::run_prediction::<Wgpu>(&model_path, &image_url, WgpuDevice::default())?;
                }
                DeviceType::Cpu => {
                    pipeline::run_prediction::<NdArray>(&model_path, &image_url, NdArrayDevice::Cpu)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn defaults_to_training() {
        let cli = parse_args(&[]).unwrap();
        assert!(matches!(cli.command, Command::Train { dataset_url: None, image_url: None }));
        assert_eq!(cli.config_path, AppConfig::default_path());
        assert!(!cli.force_cpu);
    }

    #[test]
    fn parses_train_options() {
        let cli = parse_args(&args(&[
            "--config", "custom.json", "--cpu", "train", "--dataset-url", "https://a/b.tgz",
        ]))
        .unwrap();
        assert_eq!(cli.config_path, PathBuf::from("custom.json"));
        assert!(cli.force_cpu);
        match cli.command {
            Command::Train { dataset_url, .. } => {
                assert_eq!(dataset_url.as_deref(), Some("https://a/b.tgz"))
            }
            Command::Predict { .. } => panic!("expected train"),
        }
    }

    #[test]
    fn parses_predict_with_positional_url() {
        let cli = parse_args(&args(&["predict", "m.tar.gz", "https://x/y.jpg"])).unwrap();
        match cli.command {
            Command::Predict {
                model_path,
                image_url,
            } => {
                assert_eq!(model_path, PathBuf::from("m.tar.gz"));
                assert_eq!(image_url.as_deref(), Some("https://x/y.jpg"));
            }
            Command::Train { .. } => panic!("expected predict"),
        }
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(parse_args(&args(&["predict"])).is_err());
        assert!(parse_args(&args(&["evaluate"])).is_err());
        assert!(parse_args(&args(&["--unknown"])).is_err());
        assert!(parse_args(&args(&["--config"])).is_err());
    }
}

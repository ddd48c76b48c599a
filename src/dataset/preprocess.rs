//! 画像の前処理
//!
//! RGBに変換してモデル入力サイズにリサイズし、(C, H, W) 順の `f32` に並べ替えます。
//! 画素値は 0〜255 のまま渡し、スケーリングはモデル側で行います。

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use std::path::Path;

use crate::model::config::ImageSettings;

/// チャネル数（RGB）
pub const CHANNELS: usize = 3;

/// 画像ファイルを読み込んで前処理
pub fn load_image_pixels(path: &Path, size: ImageSettings, filter: FilterType) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("画像を読み込めません: {}", path.display()))?;
    Ok(image_to_pixels(&img, size, filter))
}

/// メモリ上の画像データをデコードして前処理
pub fn decode_image_pixels(bytes: &[u8], size: ImageSettings, filter: FilterType) -> Result<Vec<f32>> {
    let img = image::load_from_memory(bytes).context("画像をデコードできません")?;
    Ok(image_to_pixels(&img, size, filter))
}

/// 任意の画像をリサイズして (C, H, W) の画素列に変換
pub fn image_to_pixels(img: &DynamicImage, size: ImageSettings, filter: FilterType) -> Vec<f32> {
    let mut rgb = img.to_rgb8();
    if rgb.width() as usize != size.width || rgb.height() as usize != size.height {
        rgb = image::imageops::resize(&rgb, size.width as u32, size.height as u32, filter);
    }
    rgb_to_chw(&rgb)
}

fn rgb_to_chw(rgb: &RgbImage) -> Vec<f32> {
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let plane = width * height;
    let mut data = vec![0.0f32; CHANNELS * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * width + x as usize;
        for c in 0..CHANNELS {
            data[c * plane + offset] = pixel[c] as f32;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn resizes_and_orders_channels_first() {
        let img = RgbImage::from_pixel(10, 6, Rgb([10, 20, 30]));
        let size = ImageSettings { height: 3, width: 5 };
        let pixels = image_to_pixels(&DynamicImage::ImageRgb8(img), size, FilterType::Nearest);

        assert_eq!(pixels.len(), CHANNELS * 3 * 5);
        assert!(pixels[..15].iter().all(|&v| v == 10.0));
        assert!(pixels[15..30].iter().all(|&v| v == 20.0));
        assert!(pixels[30..].iter().all(|&v| v == 30.0));
    }

    #[test]
    fn keeps_raw_pixel_range() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([255, 128, 1]));
        let size = ImageSettings { height: 1, width: 2 };
        let pixels = image_to_pixels(&DynamicImage::ImageRgb8(img), size, FilterType::Nearest);

        assert_eq!(pixels, vec![0.0, 255.0, 0.0, 128.0, 0.0, 1.0]);
    }

    #[test]
    fn decode_rejects_garbage() {
        let size = ImageSettings { height: 4, width: 4 };
        assert!(decode_image_pixels(b"not an image", size, FilterType::Nearest).is_err());
    }

    #[test]
    fn loads_grayscale_file_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gray.png");
        image::GrayImage::from_pixel(4, 4, image::Luma([77])).save(&path).unwrap();

        let size = ImageSettings { height: 4, width: 4 };
        let pixels = load_image_pixels(&path, size, FilterType::Triangle).unwrap();
        assert_eq!(pixels.len(), 48);
        assert!(pixels.iter().all(|&v| v == 77.0));
    }
}

// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/input.rs - 图像输入
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("Empty upload")]
  Empty,
  #[error("Unrecognized image format: {0}")]
  Format(std::io::Error),
  #[error("Image decoding failed: {0}")]
  Image(#[from] image::ImageError),
}

/// 解码上传的图像字节，统一转换为 8 位 RGB（去除透明通道，灰度扩展为三通道）
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, DecodeError> {
  if bytes.is_empty() {
    return Err(DecodeError::Empty);
  }

  let reader = ImageReader::new(std::io::Cursor::new(bytes))
    .with_guessed_format()
    .map_err(DecodeError::Format)?;
  debug!("上传图像格式: {:?}", reader.format());

  let image = reader.decode()?.to_rgb8();
  debug!("上传图像尺寸: {}x{}", image.width(), image.height());
  Ok(image)
}

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error(transparent)]
  DecodeError(#[from] DecodeError),
}

/// 从 `image:///path` 读取一张图像，供命令行工具使用
pub struct ImageFileInput {
  image: RgbImage,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let bytes = std::fs::read(url.path())?;
    Ok(ImageFileInput {
      image: decode_image(&bytes)?,
    })
  }
}

impl ImageFileInput {
  pub fn image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_image(self) -> RgbImage {
    self.image
  }
}

#[cfg(test)]
mod tests {
  use image::{DynamicImage, ImageFormat, LumaA, Rgb, Rgba};

  use super::*;

  fn encode(image: DynamicImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    image.write_to(&mut buffer, format).unwrap();
    buffer.into_inner()
  }

  #[test]
  fn decodes_png_and_jpeg_to_rgb() {
    let rgb = RgbImage::from_pixel(8, 6, Rgb([200, 100, 50]));
    let png = encode(DynamicImage::ImageRgb8(rgb.clone()), ImageFormat::Png);
    assert_eq!(decode_image(&png).unwrap(), rgb);

    let jpeg = encode(DynamicImage::ImageRgb8(rgb), ImageFormat::Jpeg);
    assert_eq!(decode_image(&jpeg).unwrap().dimensions(), (8, 6));
  }

  #[test]
  fn alpha_and_grayscale_become_three_channels() {
    let rgba = image::RgbaImage::from_pixel(3, 3, Rgba([10, 20, 30, 0]));
    let png = encode(DynamicImage::ImageRgba8(rgba), ImageFormat::Png);
    assert_eq!(*decode_image(&png).unwrap().get_pixel(0, 0), Rgb([10, 20, 30]));

    let gray = image::GrayAlphaImage::from_pixel(2, 2, LumaA([77, 255]));
    let png = encode(DynamicImage::ImageLumaA8(gray), ImageFormat::Png);
    assert_eq!(*decode_image(&png).unwrap().get_pixel(1, 1), Rgb([77, 77, 77]));
  }

  #[test]
  fn garbage_and_empty_uploads_fail() {
    assert!(matches!(decode_image(&[]), Err(DecodeError::Empty)));
    assert!(decode_image(b"this is not an image at all").is_err());
  }

  #[test]
  fn reads_image_file_urls() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.png");
    RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).save(&path).unwrap();

    let url = Url::parse(&format!("image://{}", path.display())).unwrap();
    let input = ImageFileInput::from_url(&url).unwrap();
    assert_eq!(input.image().dimensions(), (4, 4));

    let wrong = Url::parse("video:///dev/video0").unwrap();
    assert!(matches!(
      ImageFileInput::from_url(&wrong),
      Err(ImageFileInputError::SchemaMismatch)
    ));
  }
}

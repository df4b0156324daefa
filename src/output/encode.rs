// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/output/encode.rs - 图像传输编码
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

use std::io::Cursor;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use image::{ImageFormat, RgbImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
  #[error("PNG 编码失败: {0}")]
  Png(#[from] image::ImageError),
  #[error("base64 解码失败: {0}")]
  Base64(#[from] base64::DecodeError),
}

/// 无损 PNG 编码
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>, EncodeError> {
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Png)?;
  Ok(buffer.into_inner())
}

/// PNG 编码后再做标准 base64 编码，用于 JSON 响应
pub fn encode_png_base64(image: &RgbImage) -> Result<String, EncodeError> {
  Ok(BASE64.encode(encode_png(image)?))
}

pub fn decode_png_base64(text: &str) -> Result<RgbImage, EncodeError> {
  let bytes = BASE64.decode(text.trim())?;
  let image = image::load_from_memory_with_format(&bytes, ImageFormat::Png)?;
  Ok(image.to_rgb8())
}

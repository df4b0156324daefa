// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/explain/scoped.rs - 作用域内的临时文件
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

use std::{io::Write, path::Path};

use image::{ImageFormat, RgbImage};
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::explain::ExplainError;

const TEMP_IMAGE_PREFIX: &str = "chongjian-xai-";
const TEMP_IMAGE_SUFFIX: &str = ".png";
const TEMP_DIR_PREFIX: &str = "chongjian-xai-out-";

/// 保存 PNG 图像的临时文件，离开作用域时删除
pub struct ScopedTempImage {
  file: NamedTempFile,
}

impl ScopedTempImage {
  pub fn write_png(image: &RgbImage) -> Result<Self, ExplainError> {
    let mut file = tempfile::Builder::new()
      .prefix(TEMP_IMAGE_PREFIX)
      .suffix(TEMP_IMAGE_SUFFIX)
      .tempfile()
      .map_err(ExplainError::TempFile)?;

    image.write_to(file.as_file_mut(), ImageFormat::Png)?;
    file.as_file_mut().flush().map_err(ExplainError::TempFile)?;
    debug!("创建临时图像: {}", file.path().display());

    Ok(Self { file })
  }

  pub fn path(&self) -> &Path {
    self.file.path()
  }
}

/// 外部解释程序的输出目录，离开作用域时连同内容一并删除
pub struct ScopedTempDir {
  dir: TempDir,
}

impl ScopedTempDir {
  pub fn new() -> Result<Self, ExplainError> {
    let dir = tempfile::Builder::new()
      .prefix(TEMP_DIR_PREFIX)
      .tempdir()
      .map_err(ExplainError::TempFile)?;
    Ok(Self { dir })
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }
}

#[cfg(test)]
mod tests {
  use image::Rgb;

  use super::*;

  #[test]
  fn temp_image_lives_until_drop() {
    let image = RgbImage::from_pixel(3, 2, Rgb([4, 5, 6]));
    let scoped = ScopedTempImage::write_png(&image).unwrap();
    let path = scoped.path().to_path_buf();

    assert!(path.extension().is_some_and(|ext| ext == "png"));
    assert_eq!(image::open(&path).unwrap().to_rgb8(), image);

    drop(scoped);
    assert!(!path.exists());
  }

  #[test]
  fn concurrent_temp_images_do_not_collide() {
    let image = RgbImage::new(1, 1);
    let a = ScopedTempImage::write_png(&image).unwrap();
    let b = ScopedTempImage::write_png(&image).unwrap();
    assert_ne!(a.path(), b.path());
  }

  #[test]
  fn temp_dir_is_removed_with_contents() {
    let dir = ScopedTempDir::new().unwrap();
    let path = dir.path().to_path_buf();
    std::fs::write(path.join("heatmap.png"), b"x").unwrap();
    drop(dir);
    assert!(!path.exists());
  }

  #[test]
  fn temp_image_is_removed_during_unwinding() {
    let image = RgbImage::new(2, 2);
    let path = std::panic::catch_unwind(|| {
      let scoped = ScopedTempImage::write_png(&image).unwrap();
      let path = scoped.path().to_path_buf();
      std::panic::panic_any(path);
    })
    .unwrap_err()
    .downcast::<std::path::PathBuf>()
    .unwrap();
    assert!(!path.exists());
  }
}

// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/output/save_image_file.rs - 保存标注图像与检测报告
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

use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value,
  model::DetectResult,
  output::{Render, draw::Draw},
  report::DetectionReport,
};

/// 将标注后的图像保存为 PNG，同名 `.json` 文件保存检测报告
pub struct SaveImageFileOutput<'a> {
  path: PathBuf,
  draw: Draw<'a>,
  draw_labels: bool,
}

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("报告序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
}

impl<'a> FromUrlWithScheme for SaveImageFileOutput<'a> {
  const SCHEME: &'static str = "image";
}

impl<'a> FromUrl for SaveImageFileOutput<'a> {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(SaveImageFileOutput {
      path: PathBuf::from(uri.path()),
      draw: Draw::default(),
      draw_labels: query_value(uri, "labels").is_none_or(|v| v != "false"),
    })
  }
}

impl<'a> SaveImageFileOutput<'a> {
  pub fn new(path: impl AsRef<Path>) -> Self {
    Self {
      path: path.as_ref().to_path_buf(),
      draw: Draw::default(),
      draw_labels: true,
    }
  }

  pub fn report_path(&self) -> PathBuf {
    self.path.with_extension("json")
  }

  fn save(&self, image: &RgbImage, report: &DetectionReport) -> Result<(), SaveImageFileError> {
    if let Some(parent) = self.path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }

    image.save_with_format(&self.path, ImageFormat::Png)?;
    std::fs::write(self.report_path(), serde_json::to_vec_pretty(report)?)?;

    info!("保存结果到文件: {}", self.path.display());

    Ok(())
  }
}

impl<'a> Render for SaveImageFileOutput<'a> {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    report: &DetectionReport,
  ) -> Result<(), Self::Error> {
    let annotated = self.draw.annotate(image, result, true, self.draw_labels);
    self.save(&annotated, report)
  }
}

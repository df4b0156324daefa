// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/output.rs - 输出定义
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

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::DetectResult, report::DetectionReport};

pub trait Render: Sized {
  type Error;
  fn render_result(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    report: &DetectionReport,
  ) -> Result<(), Self::Error>;
}

pub mod draw;
pub mod encode;

mod save_image_file;
pub use self::save_image_file::{SaveImageFileError, SaveImageFileOutput};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("保存图像文件错误: {0}")]
  SaveImageFileError(#[from] SaveImageFileError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

pub enum OutputWrapper<'a> {
  SaveImageFileOutput(SaveImageFileOutput<'a>),
}

impl<'a> FromUrl for OutputWrapper<'a> {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      SaveImageFileOutput::<'a>::SCHEME => {
        let output = SaveImageFileOutput::from_url(url)?;
        Ok(OutputWrapper::SaveImageFileOutput(output))
      }
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl<'a> Render for OutputWrapper<'a> {
  type Error = OutputError;

  fn render_result(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    report: &DetectionReport,
  ) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::SaveImageFileOutput(output) => output
        .render_result(image, result, report)
        .map_err(OutputError::from),
    }
  }
}

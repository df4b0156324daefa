// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/explain.rs - 检测结果的可解释性热力图
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

use std::{fmt, future::Future, path::Path, str::FromStr, time::Duration};

use image::RgbImage;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::ModelError, output::encode::EncodeError};

pub mod colormap;

mod scoped;
pub use self::scoped::{ScopedTempDir, ScopedTempImage};

mod command;
pub use self::command::CommandExplainer;

#[cfg(feature = "model_onnx")]
mod eigen_cam;
#[cfg(feature = "model_onnx")]
pub use self::eigen_cam::{EigenCamBuilder, EigenCamExplainer, first_principal_projection};

/// 显著性图的计算方法，名称与请求参数中的写法一致
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CamMethod {
  GradCAM,
  GradCAMPlusPlus,
  HiResCAM,
  EigenCAM,
  EigenGradCAM,
  LayerCAM,
}

impl CamMethod {
  pub const ALL: [CamMethod; 6] = [
    CamMethod::GradCAM,
    CamMethod::GradCAMPlusPlus,
    CamMethod::HiResCAM,
    CamMethod::EigenCAM,
    CamMethod::EigenGradCAM,
    CamMethod::LayerCAM,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      CamMethod::GradCAM => "GradCAM",
      CamMethod::GradCAMPlusPlus => "GradCAMPlusPlus",
      CamMethod::HiResCAM => "HiResCAM",
      CamMethod::EigenCAM => "EigenCAM",
      CamMethod::EigenGradCAM => "EigenGradCAM",
      CamMethod::LayerCAM => "LayerCAM",
    }
  }
}

impl fmt::Display for CamMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CamMethod {
  type Err = ExplainError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    CamMethod::ALL
      .into_iter()
      .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
      .ok_or_else(|| ExplainError::InvalidParams(format!("未知的热力图方法: {}", s)))
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplainParams {
  pub method: CamMethod,
  /// 目标层序号，多个层的结果取平均
  pub layers: Vec<u32>,
  pub conf_threshold: f32,
  /// 只在检测框内重新归一化，框外置零
  pub renormalize: bool,
  pub show_box: bool,
}

impl Default for ExplainParams {
  fn default() -> Self {
    Self {
      method: CamMethod::GradCAM,
      layers: vec![18, 20, 22],
      conf_threshold: 0.2,
      renormalize: false,
      show_box: false,
    }
  }
}

impl ExplainParams {
  pub fn validate(&self) -> Result<(), ExplainError> {
    if self.layers.is_empty() {
      return Err(ExplainError::InvalidParams("至少需要一个目标层".to_string()));
    }
    if !(0.0..=1.0).contains(&self.conf_threshold) {
      return Err(ExplainError::InvalidParams(format!(
        "置信度阈值超出范围: {}",
        self.conf_threshold
      )));
    }
    Ok(())
  }

  /// 解析逗号分隔的层序号，如 `18,20,22`
  pub fn parse_layers(text: &str) -> Result<Vec<u32>, ExplainError> {
    text
      .split(',')
      .map(str::trim)
      .filter(|s| !s.is_empty())
      .map(|s| {
        s.parse()
          .map_err(|_| ExplainError::InvalidParams(format!("层序号无效: {}", s)))
      })
      .collect()
  }
}

/// 解释器的输出，有的后端只给出一张图，有的给出一组
#[derive(Debug, Clone)]
pub enum ExplainOutput {
  Single(RgbImage),
  Batch(Vec<RgbImage>),
}

impl ExplainOutput {
  pub fn into_single(self) -> Result<RgbImage, ExplainError> {
    match self {
      ExplainOutput::Single(image) => Ok(image),
      ExplainOutput::Batch(images) => images.into_iter().next().ok_or(ExplainError::EmptyOutput),
    }
  }
}

#[derive(Error, Debug)]
pub enum ExplainError {
  #[error("Explainer is not configured")]
  NotConfigured,
  #[error("Explanation method {0} is not supported by this explainer")]
  UnsupportedMethod(CamMethod),
  #[error("Invalid explanation parameters: {0}")]
  InvalidParams(String),
  #[error("Target layer output '{0}' is not available")]
  LayerUnavailable(String),
  #[error("Explainer produced no image")]
  EmptyOutput,
  #[error("Explainer command failed ({status}): {stderr}")]
  CommandFailed { status: String, stderr: String },
  #[error("Explainer timed out after {0:?}")]
  Timeout(Duration),
  #[error("Temporary file error: {0}")]
  TempFile(std::io::Error),
  #[error("Explainer I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Heatmap image error: {0}")]
  ImageError(#[from] image::ImageError),
  #[error(transparent)]
  ModelError(#[from] ModelError),
  #[error("Heatmap encoding failed: {0}")]
  Encode(#[from] EncodeError),
  #[error("Explainer task failed: {0}")]
  TaskFailed(String),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

impl From<tokio::task::JoinError> for ExplainError {
  fn from(err: tokio::task::JoinError) -> Self {
    ExplainError::TaskFailed(err.to_string())
  }
}

pub trait Explain: Send + Sync {
  /// 对磁盘上的一张图像生成热力图
  fn explain(
    &self,
    image_path: &Path,
    params: &ExplainParams,
  ) -> impl Future<Output = Result<ExplainOutput, ExplainError>> + Send;
}

/// 将图像写入临时文件后交给解释器，只取第一张结果
///
/// 临时文件由当前 future 持有，无论成功、失败还是请求被取消都会被删除。
pub async fn explain_image<E: Explain>(
  explainer: &E,
  image: RgbImage,
  params: &ExplainParams,
) -> Result<RgbImage, ExplainError> {
  params.validate()?;

  let scoped = tokio::task::spawn_blocking(move || ScopedTempImage::write_png(&image)).await??;
  debug!("热力图输入临时文件: {}", scoped.path().display());

  let output = explainer.explain(scoped.path(), params).await?;
  output.into_single()
}

/// 根据 URL 方案选择解释器后端
pub enum ExplainerWrapper {
  #[cfg(feature = "model_onnx")]
  EigenCam(EigenCamExplainer),
  Command(CommandExplainer),
}

impl FromUrl for ExplainerWrapper {
  type Error = ExplainError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "model_onnx")]
    if url.scheme() == EigenCamBuilder::SCHEME {
      let explainer = EigenCamBuilder::from_url(url)?.build()?;
      return Ok(ExplainerWrapper::EigenCam(explainer));
    }
    if url.scheme() == CommandExplainer::SCHEME {
      return Ok(ExplainerWrapper::Command(CommandExplainer::from_url(url)?));
    }
    Err(ExplainError::SchemeMismatch)
  }
}

impl ExplainerWrapper {
  /// 未显式指定方法时使用的默认方法
  pub fn default_method(&self) -> CamMethod {
    match self {
      #[cfg(feature = "model_onnx")]
      ExplainerWrapper::EigenCam(_) => CamMethod::EigenCAM,
      ExplainerWrapper::Command(_) => CamMethod::GradCAM,
    }
  }
}

impl Explain for ExplainerWrapper {
  async fn explain(
    &self,
    image_path: &Path,
    params: &ExplainParams,
  ) -> Result<ExplainOutput, ExplainError> {
    match self {
      #[cfg(feature = "model_onnx")]
      ExplainerWrapper::EigenCam(explainer) => explainer.explain(image_path, params).await,
      ExplainerWrapper::Command(explainer) => explainer.explain(image_path, params).await,
    }
  }
}

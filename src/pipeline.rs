// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/pipeline.rs - 检测与解释请求处理流程
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

use std::{fmt, sync::Arc};

use axum::http::StatusCode;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
  explain::{CamMethod, Explain, ExplainError, ExplainParams, explain_image},
  input::{DecodeError, decode_image},
  model::{DetectResult, DetectionService, Model, ModelError},
  output::encode::encode_png_base64,
  reference::ReferenceLookup,
  report::{DetectionReport, ReportConfig, build_report},
};

/// 单次请求所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Received,
  Decoded,
  Detected,
  Annotated,
  Explained,
  Reported,
  Sent,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Received => "received",
      Stage::Decoded => "decoded",
      Stage::Detected => "detected",
      Stage::Annotated => "annotated",
      Stage::Explained => "explained",
      Stage::Reported => "reported",
      Stage::Sent => "sent",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("Access denied")]
  Unauthorized,
  #[error("Model not loaded. Please ensure the model file exists.")]
  ModelUnavailable,
  #[error("Invalid image file: {0}")]
  Decode(#[from] DecodeError),
  #[error("Heatmap generation failed: {0}")]
  Explanation(#[from] ExplainError),
  #[error("Error processing image: {message}")]
  Unclassified { stage: Stage, message: String },
}

impl PipelineError {
  pub fn status(&self) -> StatusCode {
    match self {
      PipelineError::Unauthorized => StatusCode::FORBIDDEN,
      PipelineError::ModelUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
      PipelineError::Decode(_) => StatusCode::BAD_REQUEST,
      PipelineError::Explanation(_) => StatusCode::BAD_GATEWAY,
      PipelineError::Unclassified { .. } => StatusCode::BAD_REQUEST,
    }
  }

  fn unclassified(stage: Stage, err: impl fmt::Display) -> Self {
    PipelineError::Unclassified {
      stage,
      message: err.to_string(),
    }
  }

  fn from_model(stage: Stage, err: ModelError) -> Self {
    match err {
      ModelError::ModelUnavailable => PipelineError::ModelUnavailable,
      other => PipelineError::unclassified(stage, other),
    }
  }
}

/// `/predict` 的查询参数
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PredictOptions {
  pub confidence_threshold: f32,
  pub show_boxes: bool,
  pub show_labels: bool,
  pub with_heatmap: bool,
}

impl PredictOptions {
  pub fn validate(&self) -> Result<(), PipelineError> {
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(PipelineError::unclassified(
        Stage::Received,
        format!("置信度阈值超出范围: {}", self.confidence_threshold),
      ));
    }
    Ok(())
  }
}

impl Default for PredictOptions {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.5,
      show_boxes: true,
      show_labels: true,
      with_heatmap: true,
    }
  }
}

/// `/explain` 的查询参数，未给出的字段沿用服务端默认值
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExplainOverrides {
  pub method: Option<String>,
  pub layers: Option<String>,
  pub conf_threshold: Option<f32>,
  pub renormalize: Option<bool>,
  pub show_box: Option<bool>,
}

impl ExplainOverrides {
  pub fn apply(&self, defaults: &ExplainParams) -> Result<ExplainParams, PipelineError> {
    let invalid = |e: ExplainError| PipelineError::unclassified(Stage::Received, e);

    let mut params = defaults.clone();
    if let Some(method) = &self.method {
      params.method = method.parse::<CamMethod>().map_err(invalid)?;
    }
    if let Some(layers) = &self.layers {
      params.layers = ExplainParams::parse_layers(layers).map_err(invalid)?;
    }
    if let Some(conf) = self.conf_threshold {
      params.conf_threshold = conf;
    }
    if let Some(renormalize) = self.renormalize {
      params.renormalize = renormalize;
    }
    if let Some(show_box) = self.show_box {
      params.show_box = show_box;
    }
    params.validate().map_err(invalid)?;
    Ok(params)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
  pub image_base64: String,
  pub image_heatmap: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub heatmap_error: Option<String>,
  #[serde(flatten)]
  pub report: DetectionReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainResponse {
  pub image_heatmap: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  /// 请求头中必须携带的共享密钥
  pub api_key: String,
  pub report: ReportConfig,
  pub explain: ExplainParams,
}

/// 启动时构造一次的处理流程，之后在各请求间只读共享
pub struct Pipeline<M, E> {
  detection: DetectionService<M>,
  explainer: Option<Arc<E>>,
  reference: Option<Arc<dyn ReferenceLookup>>,
  config: Arc<PipelineConfig>,
}

impl<M, E> Clone for Pipeline<M, E> {
  fn clone(&self) -> Self {
    Self {
      detection: self.detection.clone(),
      explainer: self.explainer.clone(),
      reference: self.reference.clone(),
      config: self.config.clone(),
    }
  }
}

/// 在阻塞线程池上执行 CPU 密集的阶段
async fn blocking<T, F>(stage: Stage, f: F) -> Result<T, PipelineError>
where
  F: FnOnce() -> T + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| PipelineError::unclassified(stage, e))
}

impl<M, E> Pipeline<M, E>
where
  M: Model + 'static,
  E: Explain + 'static,
{
  pub fn new(detection: DetectionService<M>, explainer: Option<E>, config: PipelineConfig) -> Self {
    Self {
      detection,
      explainer: explainer.map(Arc::new),
      reference: None,
      config: Arc::new(config),
    }
  }

  pub fn with_reference(mut self, reference: Arc<dyn ReferenceLookup>) -> Self {
    self.reference = Some(reference);
    self
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn model_loaded(&self) -> bool {
    self.detection.is_ready()
  }

  pub fn explainer_configured(&self) -> bool {
    self.explainer.is_some()
  }

  pub fn authorize(&self, presented: Option<&str>) -> Result<(), PipelineError> {
    match presented {
      Some(key) if key == self.config.api_key => Ok(()),
      _ => Err(PipelineError::Unauthorized),
    }
  }

  /// 在读取上传内容之前快速失败
  pub fn ensure_ready(&self) -> Result<(), PipelineError> {
    if self.detection.is_ready() {
      Ok(())
    } else {
      Err(PipelineError::ModelUnavailable)
    }
  }

  async fn decode(&self, bytes: Vec<u8>) -> Result<RgbImage, PipelineError> {
    debug!("阶段 {}: 上传 {} 字节", Stage::Received, bytes.len());
    let image = blocking(Stage::Received, move || decode_image(&bytes)).await??;
    debug!("阶段 {}: {}x{}", Stage::Decoded, image.width(), image.height());
    Ok(image)
  }

  /// 生成热力图并编码为 base64 PNG，编码失败同样属于解释阶段的错误
  async fn explain_heatmap(&self, image: RgbImage, params: &ExplainParams) -> Result<String, ExplainError> {
    let explainer = self.explainer.as_deref().ok_or(ExplainError::NotConfigured)?;
    let heatmap = explain_image(explainer, image, params).await?;
    let encoded = tokio::task::spawn_blocking(move || encode_png_base64(&heatmap)).await??;
    debug!("阶段 {}", Stage::Explained);
    Ok(encoded)
  }

  /// 检测、标注、生成热力图与报告；热力图失败不影响检测结果
  pub async fn predict(&self, bytes: Vec<u8>, options: PredictOptions) -> Result<PredictResponse, PipelineError> {
    self.ensure_ready()?;
    options.validate()?;
    let image = Arc::new(self.decode(bytes).await?);

    let detection = self.detection.clone();
    let source = image.clone();
    let result: DetectResult = blocking(Stage::Decoded, move || {
      detection.detect(&source, options.confidence_threshold)
    })
    .await?
    .map_err(|e| PipelineError::from_model(Stage::Decoded, e))?;
    debug!("阶段 {}: {} 个目标", Stage::Detected, result.len());

    let detection = self.detection.clone();
    let source = image.clone();
    let annotated_result = result.clone();
    let image_base64 = blocking(Stage::Detected, move || {
      let annotated = detection.annotate(
        &source,
        &annotated_result,
        options.show_boxes,
        options.show_labels,
      );
      encode_png_base64(&annotated)
    })
    .await?
    .map_err(|e| PipelineError::unclassified(Stage::Annotated, e))?;
    debug!("阶段 {}", Stage::Annotated);

    let (image_heatmap, heatmap_error) = if options.with_heatmap {
      match self.explain_heatmap(image.as_ref().clone(), &self.config.explain).await {
        Ok(encoded) => (Some(encoded), None),
        Err(e) => {
          warn!("热力图生成失败, 仅返回检测结果: {}", e);
          (None, Some(e.to_string()))
        }
      }
    } else {
      (None, None)
    };

    let report = self.report(result).await?;
    debug!("阶段 {}", Stage::Sent);

    Ok(PredictResponse {
      image_base64,
      image_heatmap,
      heatmap_error,
      report,
    })
  }

  async fn report(&self, result: DetectResult) -> Result<DetectionReport, PipelineError> {
    let report_config = self.config.report;
    let reference = self.reference.clone();
    let report = blocking(Stage::Reported, move || {
      let mut report = build_report(&result, &report_config);
      if let Some(reference) = reference {
        report.enrich(reference.as_ref());
      }
      report
    })
    .await?;
    debug!(
      "阶段 {}: {} 条记录",
      Stage::Reported,
      report.summary.total_detections
    );
    Ok(report)
  }

  /// 单独生成热力图，失败直接作为请求错误返回
  pub async fn explain(&self, bytes: Vec<u8>, params: ExplainParams) -> Result<ExplainResponse, PipelineError> {
    self.ensure_ready()?;
    let image = self.decode(bytes).await?;

    let image_heatmap = self.explain_heatmap(image, &params).await?;
    debug!("阶段 {}", Stage::Sent);
    Ok(ExplainResponse { image_heatmap })
  }
}

// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/model.rs - 检测模型
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

use std::sync::Arc;

use image::RgbImage;
use thiserror::Error;
use url::Url;

use crate::FromUrl;
use crate::output::draw::Draw;

mod labels;
pub use self::labels::{ClassNames, LabelError};

#[cfg(feature = "model_onnx")]
mod session;
#[cfg(feature = "model_onnx")]
pub use self::session::{OrtInferenceSession, OutputTensor};

#[cfg(feature = "model_onnx")]
mod yolo;
#[cfg(feature = "model_onnx")]
pub use self::yolo::{YoloOnnx, YoloOnnxBuilder, decode_yolo_output};

pub trait Model: Send + Sync {
  /// 检测一张图像，`confidence_threshold` 以下的候选框在模型层面被丢弃
  fn infer(&self, image: &RgbImage, confidence_threshold: f32) -> Result<DetectResult, ModelError>;

  fn class_names(&self) -> &Arc<ClassNames>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]，原图像素坐标
}

#[derive(Debug, Clone)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
  pub names: Arc<ClassNames>,
}

impl DetectResult {
  pub fn empty(names: Arc<ClassNames>) -> Self {
    Self {
      items: Box::new([]),
      names,
    }
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("Model not loaded. Please ensure the model file exists.")]
  ModelUnavailable,
  #[error("Model path error: {0}")]
  ModelPathError(String),
  #[error("Model I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[cfg(feature = "model_onnx")]
  #[error("ONNX Runtime error: {0}")]
  OrtError(#[from] ort::Error),
  #[error("Model output '{0}' not found")]
  MissingOutput(String),
  #[error("Unexpected model output: {0}")]
  InvalidOutput(String),
  #[error("Inference session lock poisoned")]
  LockPoisoned,
  #[error(transparent)]
  LabelError(#[from] LabelError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

/// 进程级的检测服务句柄，启动时构造一次，之后只读
pub struct DetectionService<M> {
  model: Option<Arc<M>>,
  draw: Arc<Draw<'static>>,
}

impl<M> Clone for DetectionService<M> {
  fn clone(&self) -> Self {
    Self {
      model: self.model.clone(),
      draw: self.draw.clone(),
    }
  }
}

impl<M: Model> DetectionService<M> {
  pub fn ready(model: M) -> Self {
    Self::from_option(Some(model))
  }

  pub fn unavailable() -> Self {
    Self::from_option(None)
  }

  pub fn from_option(model: Option<M>) -> Self {
    Self {
      model: model.map(Arc::new),
      draw: Arc::new(Draw::default()),
    }
  }

  pub fn is_ready(&self) -> bool {
    self.model.is_some()
  }

  pub fn model(&self) -> Result<&Arc<M>, ModelError> {
    self.model.as_ref().ok_or(ModelError::ModelUnavailable)
  }

  pub fn detect(&self, image: &RgbImage, confidence_threshold: f32) -> Result<DetectResult, ModelError> {
    self.model()?.infer(image, confidence_threshold)
  }

  /// 在图像副本上绘制检测结果
  pub fn annotate(
    &self,
    image: &RgbImage,
    result: &DetectResult,
    draw_boxes: bool,
    draw_labels: bool,
  ) -> RgbImage {
    self.draw.annotate(image, result, draw_boxes, draw_labels)
  }
}

/// 根据 URL 方案选择模型后端
pub enum ModelWrapper {
  #[cfg(feature = "model_onnx")]
  Onnx(YoloOnnx),
}

impl FromUrl for ModelWrapper {
  type Error = ModelError;

  #[cfg_attr(not(feature = "model_onnx"), allow(unused_variables))]
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    #[cfg(feature = "model_onnx")]
    {
      use crate::FromUrlWithScheme;

      if url.scheme() == YoloOnnxBuilder::SCHEME {
        let model = YoloOnnxBuilder::from_url(url)?.build()?;
        return Ok(ModelWrapper::Onnx(model));
      }
    }
    Err(ModelError::SchemeMismatch)
  }
}

impl Model for ModelWrapper {
  fn infer(&self, image: &RgbImage, confidence_threshold: f32) -> Result<DetectResult, ModelError> {
    match *self {
      #[cfg(feature = "model_onnx")]
      ModelWrapper::Onnx(ref model) => model.infer(image, confidence_threshold),
    }
  }

  fn class_names(&self) -> &Arc<ClassNames> {
    match *self {
      #[cfg(feature = "model_onnx")]
      ModelWrapper::Onnx(ref model) => model.class_names(),
    }
  }
}

/// 按类别执行非极大值抑制，结果按置信度降序排列
pub fn nms(mut items: Vec<DetectItem>, iou_threshold: f32) -> Vec<DetectItem> {
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut kept: Vec<DetectItem> = Vec::with_capacity(items.len());
  for item in items {
    let suppressed = kept
      .iter()
      .any(|k| k.class_id == item.class_id && iou(&k.bbox, &item.bbox) > iou_threshold);
    if !suppressed {
      kept.push(item);
    }
  }
  kept
}

/// 计算两个边界框的 IoU
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
  let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
  let union = area_a + area_b - intersection;

  if union > 0.0 { intersection / union } else { 0.0 }
}

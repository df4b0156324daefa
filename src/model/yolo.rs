// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/model/yolo.rs - YOLO ONNX 检测模型
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

use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use image::RgbImage;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value,
  frame::RgbNchwFrame,
  model::{ClassNames, DetectItem, DetectResult, Model, ModelError, OrtInferenceSession, nms},
};

const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_INPUT_NAME: &str = "images";
const YOLO_OUTPUT_NAME: &str = "output0";
const YOLO_IOU_THRESH: f32 = 0.7;
const YOLO_BOX_COORDS: usize = 4;

pub struct YoloOnnxBuilder {
  model_path: PathBuf,
  input_size: u32,
  input_name: String,
  output_name: String,
  iou_threshold: f32,
  names_path: Option<PathBuf>,
}

impl FromUrlWithScheme for YoloOnnxBuilder {
  const SCHEME: &'static str = "onnx";
}

fn parse_param<T: std::str::FromStr>(url: &Url, key: &str, default: T) -> Result<T, ModelError> {
  match query_value(url, key) {
    Some(raw) => raw
      .parse()
      .map_err(|_| ModelError::ModelPathError(format!("参数 {} 无效: {}", key, raw))),
    None => Ok(default),
  }
}

impl FromUrl for YoloOnnxBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    Ok(YoloOnnxBuilder {
      model_path: PathBuf::from(url.path()),
      input_size: parse_param(url, "size", YOLO_INPUT_SIZE)?,
      input_name: query_value(url, "input").unwrap_or_else(|| YOLO_INPUT_NAME.to_string()),
      output_name: query_value(url, "output").unwrap_or_else(|| YOLO_OUTPUT_NAME.to_string()),
      iou_threshold: parse_param(url, "iou", YOLO_IOU_THRESH)?,
      names_path: query_value(url, "names").map(PathBuf::from),
    })
  }
}

impl YoloOnnxBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      input_size: YOLO_INPUT_SIZE,
      input_name: YOLO_INPUT_NAME.to_string(),
      output_name: YOLO_OUTPUT_NAME.to_string(),
      iou_threshold: YOLO_IOU_THRESH,
      names_path: None,
    }
  }

  pub fn input_size(mut self, input_size: u32) -> Self {
    self.input_size = input_size;
    self
  }

  pub fn iou_threshold(mut self, iou_threshold: f32) -> Self {
    self.iou_threshold = iou_threshold;
    self
  }

  pub fn names_path(mut self, names_path: impl AsRef<Path>) -> Self {
    self.names_path = Some(names_path.as_ref().to_path_buf());
    self
  }

  pub fn build(self) -> Result<YoloOnnx, ModelError> {
    let names = match &self.names_path {
      Some(path) => ClassNames::from_path(path)?,
      None => ClassNames::parasite(),
    };
    debug!("类别数量: {}", names.len());

    if self.input_size == 0 || self.input_size % 32 != 0 {
      error!("模型输入尺寸必须是 32 的正整数倍, 实际为 {}", self.input_size);
      return Err(ModelError::ModelPathError(format!(
        "模型输入尺寸无效: {}",
        self.input_size
      )));
    }

    let session = OrtInferenceSession::new(&self.model_path, &self.input_name)?;

    Ok(YoloOnnx {
      session,
      names: Arc::new(names),
      input_size: self.input_size,
      output_name: self.output_name,
      iou_threshold: self.iou_threshold,
    })
  }
}

/// Ultralytics 导出的 YOLO ONNX 模型，输出为 `[1, 4 + nc, N]`
pub struct YoloOnnx {
  session: OrtInferenceSession,
  names: Arc<ClassNames>,
  input_size: u32,
  output_name: String,
  iou_threshold: f32,
}

impl Model for YoloOnnx {
  fn infer(&self, image: &RgbImage, confidence_threshold: f32) -> Result<DetectResult, ModelError> {
    let frame = RgbNchwFrame::letterbox(image, self.input_size);
    let letterbox = *frame.letterbox_info();

    let outputs = self.session.run(frame, std::slice::from_ref(&self.output_name))?;
    let output = outputs
      .first()
      .ok_or_else(|| ModelError::MissingOutput(self.output_name.clone()))?;

    let items = decode_yolo_output(
      &output.shape,
      &output.data,
      confidence_threshold,
      self.iou_threshold,
    )?
    .into_iter()
    .map(|item| DetectItem {
      bbox: letterbox.to_source(item.bbox),
      ..item
    })
    .collect::<Vec<_>>();

    debug!("检测到 {} 个目标", items.len());

    Ok(DetectResult {
      items: items.into_boxed_slice(),
      names: self.names.clone(),
    })
  }

  fn class_names(&self) -> &Arc<ClassNames> {
    &self.names
  }
}

/// 解码 YOLO 检测头输出，框坐标仍处于模型输入坐标系
///
/// 支持 `[1, 4 + nc, N]` 以及转置后的 `[1, N, 4 + nc]` 两种布局，
/// 以较短的一维作为通道维。
pub fn decode_yolo_output(
  shape: &[usize],
  data: &[f32],
  confidence_threshold: f32,
  iou_threshold: f32,
) -> Result<Vec<DetectItem>, ModelError> {
  let (dim_a, dim_b) = match shape {
    [1, a, b] | [a, b] => (*a, *b),
    _ => {
      return Err(ModelError::InvalidOutput(format!(
        "期望三维输出 [1, C, N], 实际形状 {:?}",
        shape
      )));
    }
  };
  if data.len() != dim_a * dim_b {
    return Err(ModelError::InvalidOutput(format!(
      "输出数据长度 {} 与形状 {:?} 不匹配",
      data.len(),
      shape
    )));
  }

  let channels_first = dim_a <= dim_b;
  let (channels, proposals) = if channels_first {
    (dim_a, dim_b)
  } else {
    (dim_b, dim_a)
  };
  if channels <= YOLO_BOX_COORDS {
    return Err(ModelError::InvalidOutput(format!(
      "输出通道数 {} 不足以包含类别分数",
      channels
    )));
  }

  let at = |c: usize, p: usize| {
    if channels_first {
      data[c * proposals + p]
    } else {
      data[p * channels + c]
    }
  };

  let mut candidates = Vec::new();
  for p in 0..proposals {
    let (class_id, score) = (YOLO_BOX_COORDS..channels)
      .map(|c| ((c - YOLO_BOX_COORDS) as u32, at(c, p)))
      .fold((0u32, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if score < confidence_threshold {
      continue;
    }

    let cx = at(0, p);
    let cy = at(1, p);
    let w = at(2, p);
    let h = at(3, p);

    candidates.push(DetectItem {
      class_id,
      score: score.clamp(0.0, 1.0),
      bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
    });
  }
  debug!("阈值过滤后候选框 {} 个", candidates.len());

  Ok(nms(candidates, iou_threshold))
}

#[cfg(test)]
mod tests {
  use super::*;

  // 2 个类别，3 个候选框，通道优先布局
  fn channels_first_output() -> (Vec<usize>, Vec<f32>) {
    let data = vec![
      // cx
      50.0, 51.0, 200.0, //
      // cy
      50.0, 51.0, 200.0, //
      // w
      20.0, 20.0, 10.0, //
      // h
      20.0, 20.0, 10.0, //
      // class 0
      0.9, 0.8, 0.1, //
      // class 1
      0.05, 0.1, 0.45,
    ];
    (vec![1, 6, 3], data)
  }

  #[test]
  fn decodes_filters_and_suppresses() {
    let (shape, data) = channels_first_output();
    let items = decode_yolo_output(&shape, &data, 0.25, 0.7).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].class_id, 0);
    assert!((items[0].score - 0.9).abs() < 1e-6);
    assert_eq!(items[0].bbox, [40.0, 40.0, 60.0, 60.0]);
    assert_eq!(items[1].class_id, 1);
    assert!((items[1].score - 0.45).abs() < 1e-6);
  }

  #[test]
  fn threshold_is_applied_at_the_model_level() {
    let (shape, data) = channels_first_output();
    let items = decode_yolo_output(&shape, &data, 0.5, 0.7).unwrap();
    assert_eq!(items.len(), 1);
  }

  #[test]
  fn transposed_layout_gives_the_same_result() {
    let (_, data) = channels_first_output();
    let mut transposed = vec![0.0; data.len()];
    for c in 0..6 {
      for p in 0..3 {
        transposed[p * 6 + c] = data[c * 3 + p];
      }
    }
    // 转置布局要求候选框数多于通道数，这里补一个全零候选框
    transposed.extend(std::iter::repeat_n(0.0, 6 * 4));
    let items = decode_yolo_output(&[1, 7, 6], &transposed, 0.25, 0.7).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].bbox, [40.0, 40.0, 60.0, 60.0]);
  }

  #[test]
  fn malformed_output_is_rejected() {
    assert!(matches!(
      decode_yolo_output(&[1, 6], &[0.0; 6], 0.5, 0.7),
      Err(ModelError::InvalidOutput(_))
    ));
    assert!(matches!(
      decode_yolo_output(&[1, 6, 3], &[0.0; 5], 0.5, 0.7),
      Err(ModelError::InvalidOutput(_))
    ));
  }

  #[test]
  fn builder_reads_url_parameters() {
    let url = Url::parse("onnx:///models/best.onnx?size=320&iou=0.5&output=out").unwrap();
    let builder = YoloOnnxBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/best.onnx"));
    assert_eq!(builder.input_size, 320);
    assert_eq!(builder.iou_threshold, 0.5);
    assert_eq!(builder.output_name, "out");
    assert_eq!(builder.input_name, "images");

    let bad = Url::parse("onnx:///models/best.onnx?size=abc").unwrap();
    assert!(YoloOnnxBuilder::from_url(&bad).is_err());
    let wrong = Url::parse("rknn:///models/best.rknn").unwrap();
    assert!(YoloOnnxBuilder::from_url(&wrong).is_err());
  }
}

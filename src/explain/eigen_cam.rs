// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/explain/eigen_cam.rs - 基于 ONNX 特征输出的 EigenCAM
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
use ndarray::{Array1, Array2, ArrayView2, Axis};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value,
  explain::{
    CamMethod, Explain, ExplainError, ExplainOutput, ExplainParams,
    colormap::{self, HEATMAP_ALPHA},
  },
  frame::RgbNchwFrame,
  model::{DetectItem, ModelError, OrtInferenceSession, OutputTensor, decode_yolo_output},
  output::draw::Draw,
};

const EIGEN_CAM_INPUT_SIZE: u32 = 640;
const EIGEN_CAM_INPUT_NAME: &str = "images";
const EIGEN_CAM_OUTPUT_NAME: &str = "output0";
const EIGEN_CAM_IOU_THRESH: f32 = 0.7;
/// Ultralytics 导出图中 C2f 模块输出激活的节点名
const EIGEN_CAM_LAYER_OUTPUT: &str = "/model.{layer}/cv2/act/Mul_output_0";
const LAYER_PLACEHOLDER: &str = "{layer}";

const POWER_ITERATIONS: usize = 100;
const POWER_TOLERANCE: f32 = 1e-6;

pub struct EigenCamBuilder {
  model_path: PathBuf,
  input_size: u32,
  input_name: String,
  output_name: String,
  layer_output: String,
  iou_threshold: f32,
}

impl FromUrlWithScheme for EigenCamBuilder {
  const SCHEME: &'static str = "eigencam";
}

impl FromUrl for EigenCamBuilder {
  type Error = ExplainError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ExplainError::SchemeMismatch);
    }

    let input_size = match query_value(url, "size") {
      Some(raw) => raw
        .parse()
        .map_err(|_| ExplainError::InvalidParams(format!("参数 size 无效: {}", raw)))?,
      None => EIGEN_CAM_INPUT_SIZE,
    };
    let iou_threshold = match query_value(url, "iou") {
      Some(raw) => raw
        .parse()
        .map_err(|_| ExplainError::InvalidParams(format!("参数 iou 无效: {}", raw)))?,
      None => EIGEN_CAM_IOU_THRESH,
    };

    Ok(EigenCamBuilder {
      model_path: PathBuf::from(url.path()),
      input_size,
      input_name: query_value(url, "input").unwrap_or_else(|| EIGEN_CAM_INPUT_NAME.to_string()),
      output_name: query_value(url, "output").unwrap_or_else(|| EIGEN_CAM_OUTPUT_NAME.to_string()),
      layer_output: query_value(url, "layer_output")
        .unwrap_or_else(|| EIGEN_CAM_LAYER_OUTPUT.to_string()),
      iou_threshold,
    })
  }
}

impl EigenCamBuilder {
  pub fn new(model_path: impl AsRef<Path>) -> Self {
    Self {
      model_path: model_path.as_ref().to_path_buf(),
      input_size: EIGEN_CAM_INPUT_SIZE,
      input_name: EIGEN_CAM_INPUT_NAME.to_string(),
      output_name: EIGEN_CAM_OUTPUT_NAME.to_string(),
      layer_output: EIGEN_CAM_LAYER_OUTPUT.to_string(),
      iou_threshold: EIGEN_CAM_IOU_THRESH,
    }
  }

  pub fn layer_output(mut self, pattern: impl Into<String>) -> Self {
    self.layer_output = pattern.into();
    self
  }

  pub fn build(self) -> Result<EigenCamExplainer, ExplainError> {
    if !self.layer_output.contains(LAYER_PLACEHOLDER) {
      return Err(ExplainError::InvalidParams(format!(
        "layer_output 必须包含 {} 占位符",
        LAYER_PLACEHOLDER
      )));
    }
    if self.input_size == 0 || self.input_size % 32 != 0 {
      return Err(ExplainError::InvalidParams(format!(
        "模型输入尺寸无效: {}",
        self.input_size
      )));
    }

    info!("加载 EigenCAM 特征模型: {}", self.model_path.display());
    let session = OrtInferenceSession::new(&self.model_path, &self.input_name)?;

    Ok(EigenCamExplainer {
      inner: Arc::new(EigenCamInner {
        session,
        input_size: self.input_size,
        output_name: self.output_name,
        layer_output: self.layer_output,
        iou_threshold: self.iou_threshold,
        draw: Draw::default(),
      }),
    })
  }
}

struct EigenCamInner {
  session: OrtInferenceSession,
  input_size: u32,
  output_name: String,
  layer_output: String,
  iou_threshold: f32,
  draw: Draw<'static>,
}

/// 本地 EigenCAM 解释器，只需前向推理即可得到热力图
#[derive(Clone)]
pub struct EigenCamExplainer {
  inner: Arc<EigenCamInner>,
}

impl EigenCamInner {
  fn layer_name(&self, layer: u32) -> String {
    self.layer_output.replace(LAYER_PLACEHOLDER, &layer.to_string())
  }

  fn explain_image(&self, image: &RgbImage, params: &ExplainParams) -> Result<RgbImage, ExplainError> {
    let frame = RgbNchwFrame::letterbox(image, self.input_size);
    let letterbox = *frame.letterbox_info();

    let mut names: Vec<String> = params.layers.iter().map(|&l| self.layer_name(l)).collect();
    names.push(self.output_name.clone());

    let outputs = self.session.run(frame, &names).map_err(|e| match e {
      ModelError::MissingOutput(name) => ExplainError::LayerUnavailable(name),
      other => ExplainError::ModelError(other),
    })?;
    let Some((detections, layers)) = outputs.split_last() else {
      return Err(ExplainError::EmptyOutput);
    };

    let (height, width) = (image.height() as usize, image.width() as usize);
    let mut saliency = Array2::<f32>::zeros((height, width));
    for (name, tensor) in names.iter().zip(layers) {
      let cam = layer_cam(tensor).map_err(|_| ExplainError::LayerUnavailable(name.clone()))?;
      saliency += &colormap::resample_to_source(&cam.view(), &letterbox);
    }
    saliency /= layers.len() as f32;
    colormap::scale_min_max(&mut saliency);

    let items: Vec<DetectItem> = decode_yolo_output(
      &detections.shape,
      &detections.data,
      params.conf_threshold,
      self.iou_threshold,
    )?
    .into_iter()
    .map(|item| DetectItem {
      bbox: letterbox.to_source(item.bbox),
      ..item
    })
    .collect();
    debug!("EigenCAM 参考检测框 {} 个", items.len());

    if params.renormalize {
      saliency = colormap::renormalize_in_boxes(&saliency, &items);
    }

    let mut heatmap = colormap::overlay(image, &saliency.view(), HEATMAP_ALPHA);
    if params.show_box {
      self.draw.draw_boxes(&mut heatmap, &items);
    }
    Ok(heatmap)
  }
}

/// 由 `[1, C, h, w]` 激活计算单层 EigenCAM 图，缩放到 [0, 1]
fn layer_cam(tensor: &OutputTensor) -> Result<Array2<f32>, ExplainError> {
  let [1, channels, h, w] = tensor.shape[..] else {
    return Err(ExplainError::InvalidParams(format!(
      "激活形状无效: {:?}",
      tensor.shape
    )));
  };
  let activations = ArrayView2::from_shape((channels, h * w), &tensor.data)
    .map_err(|e| ExplainError::InvalidParams(e.to_string()))?;

  let projection = first_principal_projection(&activations.t());
  let mut cam = projection
    .into_shape_with_order((h, w))
    .map_err(|e| ExplainError::InvalidParams(e.to_string()))?;
  cam.mapv_inplace(|v| v.max(0.0));
  colormap::scale_min_max(&mut cam);
  Ok(cam)
}

/// 样本矩阵 `(n, C)` 中心化后在第一主成分方向上的投影
///
/// 用幂迭代求协方差矩阵的主特征向量；中心化后投影总和恒为零，
/// 因此符号取使绝对值最大的响应为正的方向。
pub fn first_principal_projection(samples: &ArrayView2<f32>) -> Array1<f32> {
  let (n, c) = samples.dim();
  if n == 0 || c == 0 {
    return Array1::zeros(n);
  }

  let mean = samples.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(c));
  let centered = samples - &mean;
  let covariance = centered.t().dot(&centered);

  let mut vector = Array1::from_elem(c, 1.0 / (c as f32).sqrt());
  for _ in 0..POWER_ITERATIONS {
    let next = covariance.dot(&vector);
    let norm = next.dot(&next).sqrt();
    if norm < f32::EPSILON {
      break;
    }
    let next = next / norm;
    let delta = (&next - &vector).mapv(f32::abs).sum();
    vector = next;
    if delta < POWER_TOLERANCE {
      break;
    }
  }

  let projection = centered.dot(&vector);
  let dominant = projection
    .iter()
    .copied()
    .fold(0.0f32, |best, v| if v.abs() > best.abs() { v } else { best });
  if dominant < 0.0 { -projection } else { projection }
}

impl Explain for EigenCamExplainer {
  async fn explain(
    &self,
    image_path: &Path,
    params: &ExplainParams,
  ) -> Result<ExplainOutput, ExplainError> {
    if params.method != CamMethod::EigenCAM {
      return Err(ExplainError::UnsupportedMethod(params.method));
    }
    params.validate()?;

    let inner = self.inner.clone();
    let path = image_path.to_path_buf();
    let params = params.clone();
    let heatmap = tokio::task::spawn_blocking(move || {
      let image = image::open(&path)?.to_rgb8();
      inner.explain_image(&image, &params)
    })
    .await??;

    Ok(ExplainOutput::Single(heatmap))
  }
}

#[cfg(test)]
mod tests {
  use ndarray::array;

  use super::*;

  #[test]
  fn projection_follows_the_dominant_direction() {
    // 样本沿 (1, 1) 方向分布，另一方向只有微小扰动
    let samples = array![
      [-2.0f32, -2.1],
      [-1.0, -0.9],
      [0.0, 0.1],
      [1.0, 0.9],
      [2.0, 2.0],
      [6.0, 6.1],
    ];
    let projection = first_principal_projection(&samples.view());
    assert_eq!(projection.len(), 6);
    // 投影保持样本顺序，且最大值出现在最远的样本上
    for pair in projection.windows(2) {
      assert!(pair[0] < pair[1]);
    }
    assert!(projection[5] > 0.0);
  }

  #[test]
  fn layer_cam_is_scaled_to_unit_range() {
    // 两个通道，2x2 特征图，右下角激活最强
    let tensor = OutputTensor {
      shape: vec![1, 2, 2, 2],
      data: vec![0.0, 1.0, 1.0, 4.0, 0.0, 1.0, 1.0, 4.0],
    };
    let cam = layer_cam(&tensor).unwrap();
    assert_eq!(cam.dim(), (2, 2));
    assert!((cam[[1, 1]] - 1.0).abs() < 1e-6);
    assert_eq!(cam[[0, 0]], 0.0);
  }

  #[test]
  fn layer_cam_rejects_bad_shapes() {
    let tensor = OutputTensor {
      shape: vec![1, 2, 4],
      data: vec![0.0; 8],
    };
    assert!(layer_cam(&tensor).is_err());
  }

  #[test]
  fn builder_reads_url_parameters() {
    let url = Url::parse("eigencam:///models/features.onnx?size=320&layer_output=/m.{layer}/out").unwrap();
    let builder = EigenCamBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/models/features.onnx"));
    assert_eq!(builder.input_size, 320);
    assert_eq!(builder.layer_output, "/m.{layer}/out");
    assert_eq!(builder.output_name, "output0");

    let missing = EigenCamBuilder::new("/nonexistent.onnx").layer_output("/m/out");
    assert!(matches!(missing.build(), Err(ExplainError::InvalidParams(_))));
  }
}

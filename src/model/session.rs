// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/model/session.rs - ONNX Runtime 推理会话
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

use std::{path::Path, sync::Mutex};

use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use crate::{frame::RgbNchwFrame, model::ModelError};

/// 展平的 f32 输出张量
#[derive(Debug, Clone)]
pub struct OutputTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

/// ONNX Runtime 会话，运行时要求每次推理独占会话，因此以互斥锁包装
pub struct OrtInferenceSession {
  session: Mutex<Session>,
  input_name: String,
}

impl OrtInferenceSession {
  pub fn new(model_path: &Path, input_name: &str) -> Result<Self, ModelError> {
    info!("加载模型文件: {}", model_path.display());
    if !model_path.exists() {
      return Err(ModelError::ModelPathError(format!(
        "模型文件不存在: {}",
        model_path.display()
      )));
    }

    let session = Session::builder()?.commit_from_file(model_path)?;
    debug!(
      "模型输入: {:?}",
      session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>()
    );
    debug!(
      "模型输出: {:?}",
      session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
    );
    info!("模型加载完成");

    Ok(Self {
      session: Mutex::new(session),
      input_name: input_name.to_string(),
    })
  }

  /// 执行一次推理并按名称取出输出张量，顺序与 `output_names` 一致
  pub fn run(&self, frame: RgbNchwFrame, output_names: &[String]) -> Result<Vec<OutputTensor>, ModelError> {
    let (shape, data, _) = frame.into_parts();
    let input = Tensor::from_array((shape, data))?;

    let mut session = self.session.lock().map_err(|_| ModelError::LockPoisoned)?;
    debug!("执行模型推理");
    let outputs = session.run(ort::inputs![self.input_name.as_str() => input])?;

    let mut tensors = Vec::with_capacity(output_names.len());
    for name in output_names {
      let value = outputs
        .get(name.as_str())
        .ok_or_else(|| ModelError::MissingOutput(name.clone()))?;
      let (shape, data) = value.try_extract_tensor::<f32>()?;
      tensors.push(OutputTensor {
        shape: shape.iter().map(|&d| d.max(0) as usize).collect(),
        data: data.to_vec(),
      });
    }
    debug!("获取模型输出 {} 个", tensors.len());

    Ok(tensors)
  }
}

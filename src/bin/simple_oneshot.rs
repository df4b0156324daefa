// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像检测
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use chongjian::{
  FromUrl,
  input::ImageFileInput,
  model::ModelWrapper,
  output::OutputWrapper,
  report::ReportConfig,
  species::DEFAULT_UNKNOWN_BELOW,
  task::{OneShotTask, Task, TaskConfig},
};
use tracing::info;

/// Chongjian 单张图像检测参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 检测模型，例如 onnx:///models/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入图像，例如 image:///data/sample.jpg
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径，例如 image:///tmp/result.png
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 检测置信度阈值
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// 低于该置信度的检测结果显示为未知物种
  #[arg(long, default_value_t = DEFAULT_UNKNOWN_BELOW, value_name = "THRESHOLD")]
  pub unknown_threshold: f32,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let input = ImageFileInput::from_url(&args.input)?;
  let model = ModelWrapper::from_url(&args.model)?;
  let output = OutputWrapper::from_url(&args.output)?;

  let task = OneShotTask::new(TaskConfig {
    confidence_threshold: args.confidence,
    report: ReportConfig {
      unknown_below: args.unknown_threshold,
    },
  });
  task.run_task(std::iter::once(input.into_image()), model, output)?;

  Ok(())
}

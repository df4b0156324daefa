// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/task.rs - 离线推理任务
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

use std::time::{Duration, Instant};

use image::RgbImage;
use tracing::{info, warn};

use crate::{
  model::Model,
  output::Render,
  report::{DetectionReport, ReportConfig, build_report},
};

pub trait Task<I, M, O>: Sized {
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<(), Self::Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
  pub confidence_threshold: f32,
  pub report: ReportConfig,
}

impl Default for TaskConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: 0.5,
      report: ReportConfig::default(),
    }
  }
}

fn log_report(report: &DetectionReport) {
  for record in &report.records {
    info!(
      "  {}. {} {} {}",
      record.index, record.name, record.confidence_percentage, record.confidence_emoji
    );
  }
  info!(
    "共 {} 个目标, 平均置信度 {}, {} 个物种",
    report.summary.total_detections,
    report.summary.avg_confidence_percentage(),
    report.summary.unique_species
  );
}

#[derive(Debug, Default)]
pub struct OneShotTask {
  config: TaskConfig,
}

impl OneShotTask {
  pub fn new(config: TaskConfig) -> Self {
    Self { config }
  }
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RgbImage>,
  M: Model,
  O: Render<Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像 {}x{}，开始推理...", image.width(), image.height());
    let now = Instant::now();
    let result = model.infer(&image, self.config.confidence_threshold)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());

    let report = build_report(&result, &self.config.report);
    log_report(&report);
    output.render_result(&image, &result, &report)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());

    Ok(())
  }
}

#[derive(Debug)]
pub struct RepeatShotTask {
  config: TaskConfig,
  repeat_times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self {
      config: TaskConfig::default(),
      repeat_times: 100,
    }
  }
}

impl RepeatShotTask {
  pub fn new(config: TaskConfig, repeat_times: usize) -> Self {
    Self { config, repeat_times }
  }
}

/// 平均耗时，跳过前两次预热
pub fn average_latency(times: &[Duration]) -> Option<Duration> {
  let warm = times.get(2..).filter(|rest| !rest.is_empty()).unwrap_or(times);
  if warm.is_empty() {
    return None;
  }
  Some(warm.iter().sum::<Duration>() / warm.len() as u32)
}

impl<
  RE: std::error::Error + Sync + Send + 'static,
  I: Iterator<Item = RgbImage>,
  M: Model,
  O: Render<Error = RE>,
> Task<I, M, O> for RepeatShotTask
{
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<(), Self::Error> {
    info!("开始任务...");
    let image = input.next().ok_or_else(|| anyhow::anyhow!("没有输入图像"))?;
    info!("输入图像获取成功，重复推理 {} 次...", self.repeat_times);

    let mut times = Vec::with_capacity(self.repeat_times);
    let mut last = None;
    for i in 0..self.repeat_times {
      let now = Instant::now();
      let result = model.infer(&image, self.config.confidence_threshold)?;
      let elapsed = now.elapsed();
      info!("({})推理完成，{} 个目标，耗时: {:.2?}", i, result.len(), elapsed);
      times.push(elapsed);
      last = Some(result);
    }

    if let Some(average) = average_latency(&times) {
      warn!("平均推理时间: {:.2?}", average);
    }

    if let Some(result) = last {
      let report = build_report(&result, &self.config.report);
      log_report(&report);
      output.render_result(&image, &result, &report)?;
    }

    Ok(())
  }
}

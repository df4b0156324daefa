// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/report.rs - 检测报告生成
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

use std::collections::{HashMap, HashSet};

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::{
  model::DetectResult,
  reference::{ReferenceLookup, SpeciesDetails},
  species::{self, ConfidenceTier, UNKNOWN_SPECIES},
};

#[derive(Debug, Clone, Copy)]
pub struct ReportConfig {
  /// 低于该置信度时物种显示为未知，与请求中的检测阈值相互独立
  pub unknown_below: f32,
}

impl Default for ReportConfig {
  fn default() -> Self {
    Self {
      unknown_below: species::DEFAULT_UNKNOWN_BELOW,
    }
  }
}

/// 单个检测结果的展示记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
  /// 从 1 开始，与模型输出顺序一致
  pub index: usize,
  pub name: String,
  pub confidence: f32,
  pub confidence_percentage: String,
  pub confidence_emoji: &'static str,
  #[serde(skip)]
  pub tier: ConfidenceTier,
  pub description: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub reference: Option<SpeciesDetails>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionSummary {
  pub total_detections: usize,
  #[serde(serialize_with = "serialize_percentage")]
  pub avg_confidence: f32,
  pub unique_species: usize,
}

impl PredictionSummary {
  pub fn avg_confidence_percentage(&self) -> String {
    format_percentage(self.avg_confidence)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionReport {
  #[serde(rename = "detections")]
  pub records: Vec<DetectionRecord>,
  #[serde(flatten)]
  pub summary: PredictionSummary,
}

/// 格式化为一位小数的百分比，例如 0.85 -> "85.0%"
pub fn format_percentage(value: f32) -> String {
  format!("{:.1}%", value as f64 * 100.0)
}

fn serialize_percentage<S: Serializer>(value: &f32, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&format_percentage(*value))
}

/// 由检测结果生成报告，记录顺序与检测结果顺序一致
pub fn build_report(result: &DetectResult, config: &ReportConfig) -> DetectionReport {
  let records: Vec<DetectionRecord> = result
    .items
    .iter()
    .enumerate()
    .map(|(idx, item)| {
      let confidence = item.score;
      let raw_name = result.names.resolve(item.class_id);
      let tier = ConfidenceTier::of(confidence);
      let name = species::resolve_species(&raw_name, confidence, config.unknown_below);
      let description = species::description_of(&name);

      DetectionRecord {
        index: idx + 1,
        name,
        confidence,
        confidence_percentage: format_percentage(confidence),
        confidence_emoji: tier.emoji(),
        tier,
        description,
        reference: None,
      }
    })
    .collect();

  let total_detections = records.len();
  let avg_confidence = if total_detections == 0 {
    0.0
  } else {
    result.items.iter().map(|item| item.score as f64).sum::<f64>() as f32 / total_detections as f32
  };
  let unique_species = records
    .iter()
    .map(|record| record.name.as_str())
    .collect::<HashSet<_>>()
    .len();

  debug!(
    "报告生成: {} 个检测, 平均置信度 {:.3}, {} 个物种",
    total_detections, avg_confidence, unique_species
  );

  DetectionReport {
    records,
    summary: PredictionSummary {
      total_detections,
      avg_confidence,
      unique_species,
    },
  }
}

impl DetectionReport {
  /// 用参考数据补充物种详情，查询失败只记录日志，不影响报告
  pub fn enrich(&mut self, lookup: &dyn ReferenceLookup) {
    let mut cache: HashMap<String, Option<SpeciesDetails>> = HashMap::new();

    for record in self.records.iter_mut() {
      if record.name == UNKNOWN_SPECIES {
        continue;
      }
      let details = cache
        .entry(record.name.clone())
        .or_insert_with(|| match lookup.lookup(&record.name) {
          Ok(details) => details,
          Err(e) => {
            warn!("查询物种参考数据失败 {}: {}", record.name, e);
            None
          }
        });
      record.reference = details.clone();
    }
  }
}

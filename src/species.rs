// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/species.rs - 物种描述表与置信度分级
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

use serde::Serialize;

/// 无法确认物种时使用的名称
pub const UNKNOWN_SPECIES: &str = "Unknown Species";

/// 描述表中找不到物种时的占位描述
pub const NO_DESCRIPTION: &str = "No description available.";

/// 低于该置信度的检测结果一律显示为未知物种
pub const DEFAULT_UNKNOWN_BELOW: f32 = 0.5;

/// 物种学名与描述
pub const SPECIES_DESCRIPTIONS: &[(&str, &str)] = &[
  (
    "Ancylostoma Spp",
    "Ancylostoma (hookworm) parasites attach to the small intestine and feed on blood, causing anemia and protein deficiency.",
  ),
  (
    "Ascaris Lumbricoides",
    "A large roundworm that inhabits the small intestine, causing malnutrition and intestinal blockages in severe cases.",
  ),
  (
    "Enterobius Vermicularis",
    "Pinworm infection, commonly affecting children, causing itching around the anal area, especially at night.",
  ),
  (
    "Fasciola Hepatica",
    "Liver fluke parasite that infects the bile ducts and liver, causing digestive issues and liver damage.",
  ),
  (
    "Hymenolepis",
    "Dwarf tapeworm, the smallest tapeworm in humans, causing intestinal inflammation and malabsorption.",
  ),
  (
    "Schistosoma",
    "Parasitic flatworm that lives in blood vessels, causing chronic inflammation and organ damage.",
  ),
  (
    "Taenia Sp",
    "Tapeworm that lives in the intestine, causing nutrient deficiencies and weight loss.",
  ),
  (
    "Trichuris Trichiura",
    "Whipworm that infects the colon, causing diarrhea, anemia, and rectal prolapse in heavy infections.",
  ),
  (UNKNOWN_SPECIES, "Species couldn't be identified"),
];

/// 查询物种描述，未收录的名称返回占位描述
pub fn description_of(name: &str) -> &'static str {
  SPECIES_DESCRIPTIONS
    .iter()
    .find(|(species, _)| *species == name)
    .map(|(_, description)| *description)
    .unwrap_or(NO_DESCRIPTION)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
  High,
  Medium,
  Low,
}

/// 分级表，自高向低依次比较，置信度严格大于阈值即归入该级
pub const CONFIDENCE_TIERS: &[(f32, ConfidenceTier)] = &[
  (0.8, ConfidenceTier::High),
  (0.6, ConfidenceTier::Medium),
];

impl ConfidenceTier {
  pub fn of(confidence: f32) -> Self {
    CONFIDENCE_TIERS
      .iter()
      .find(|(threshold, _)| confidence > *threshold)
      .map(|(_, tier)| *tier)
      .unwrap_or(ConfidenceTier::Low)
  }

  pub fn emoji(self) -> &'static str {
    match self {
      ConfidenceTier::High => "🟢",
      ConfidenceTier::Medium => "🟡",
      ConfidenceTier::Low => "🔴",
    }
  }
}

/// 低置信度重标注：低于 `unknown_below` 时不采信模型给出的类别
pub fn resolve_species(raw_name: &str, confidence: f32, unknown_below: f32) -> String {
  if confidence < unknown_below {
    UNKNOWN_SPECIES.to_string()
  } else {
    raw_name.to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tier_boundaries_are_strict() {
    assert_eq!(ConfidenceTier::of(1.0), ConfidenceTier::High);
    assert_eq!(ConfidenceTier::of(0.8000001), ConfidenceTier::High);
    assert_eq!(ConfidenceTier::of(0.8), ConfidenceTier::Medium);
    assert_eq!(ConfidenceTier::of(0.6000001), ConfidenceTier::Medium);
    assert_eq!(ConfidenceTier::of(0.6), ConfidenceTier::Low);
    assert_eq!(ConfidenceTier::of(0.0), ConfidenceTier::Low);
  }

  #[test]
  fn tiers_partition_the_unit_interval() {
    for step in 0..=1000 {
      let c = step as f32 / 1000.0;
      let expected = if c > 0.8 {
        ConfidenceTier::High
      } else if c > 0.6 {
        ConfidenceTier::Medium
      } else {
        ConfidenceTier::Low
      };
      assert_eq!(ConfidenceTier::of(c), expected, "confidence {}", c);
    }
  }

  #[test]
  fn low_confidence_is_relabelled() {
    assert_eq!(
      resolve_species("Ascaris Lumbricoides", 0.42, DEFAULT_UNKNOWN_BELOW),
      UNKNOWN_SPECIES
    );
    assert_eq!(
      resolve_species("Ascaris Lumbricoides", 0.5, DEFAULT_UNKNOWN_BELOW),
      "Ascaris Lumbricoides"
    );
  }

  #[test]
  fn descriptions_fall_back_to_placeholder() {
    assert_eq!(description_of(UNKNOWN_SPECIES), "Species couldn't be identified");
    assert!(description_of("Schistosoma").starts_with("Parasitic flatworm"));
    assert_eq!(description_of("class 12"), NO_DESCRIPTION);
  }
}

// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/reference.rs - 寄生虫参考资料
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

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(feature = "reference_sqlite")]
mod sqlite;
#[cfg(feature = "reference_sqlite")]
pub use self::sqlite::{ReferenceTable, SqliteReferenceStore};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
  pub kingdom: Option<String>,
  pub phylum: Option<String>,
  pub class: Option<String>,
  pub order: Option<String>,
  pub family: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
  pub drug_name: String,
  pub dosage_instruction: Option<String>,
  pub notes: Option<String>,
}

/// 一个物种的完整参考资料，由物种、分类与治疗三部分组成
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeciesDetails {
  pub scientific_name: String,
  pub common_name: Option<String>,
  pub habitat: Option<String>,
  pub description: Option<String>,
  pub taxonomy: Taxonomy,
  pub treatment: Treatment,
}

/// 批量导入文件中的一条记录
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ImportEntry {
  pub species_name: String,
  pub common_name: Option<String>,
  pub description: Option<String>,
  pub taxonomy: Taxonomy,
  pub medical_info: MedicalInfo,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MedicalInfo {
  pub treatment: String,
  pub dosage: Option<String>,
  pub habitat: Option<String>,
}

/// 批量导入的治疗记录统一使用的备注
pub const IMPORT_NOTES: &str = "Imported via JSON";

impl From<ImportEntry> for SpeciesDetails {
  fn from(entry: ImportEntry) -> Self {
    SpeciesDetails {
      scientific_name: entry.species_name,
      common_name: entry.common_name,
      habitat: entry.medical_info.habitat,
      description: entry.description,
      taxonomy: entry.taxonomy,
      treatment: Treatment {
        drug_name: entry.medical_info.treatment,
        dosage_instruction: entry.medical_info.dosage,
        notes: Some(IMPORT_NOTES.to_string()),
      },
    }
  }
}

#[derive(Error, Debug)]
pub enum ReferenceError {
  #[cfg(feature = "reference_sqlite")]
  #[error("SQLite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),
  #[error("Unknown table: {0}")]
  UnknownTable(String),
  #[error("Invalid reference data: {0}")]
  Invalid(String),
  #[error("Reference store lock poisoned")]
  LockPoisoned,
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

/// 按学名查询参考资料，大小写不敏感
pub trait ReferenceLookup: Send + Sync {
  fn lookup(&self, scientific_name: &str) -> Result<Option<SpeciesDetails>, ReferenceError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn import_entries_map_to_details() {
    let json = r#"[{
      "species_name": "Taenia Sp",
      "common_name": "Tapeworm",
      "description": "Intestinal cestode",
      "taxonomy": {"kingdom": "Animalia", "phylum": "Platyhelminthes", "class": "Cestoda", "order": "Cyclophyllidea", "family": "Taeniidae"},
      "medical_info": {"treatment": "Praziquantel", "dosage": "5-10 mg/kg", "habitat": "Intestine"}
    }]"#;
    let entries: Vec<ImportEntry> = serde_json::from_str(json).unwrap();
    let details = SpeciesDetails::from(entries[0].clone());
    assert_eq!(details.scientific_name, "Taenia Sp");
    assert_eq!(details.habitat.as_deref(), Some("Intestine"));
    assert_eq!(details.taxonomy.order.as_deref(), Some("Cyclophyllidea"));
    assert_eq!(details.treatment.drug_name, "Praziquantel");
    assert_eq!(details.treatment.notes.as_deref(), Some(IMPORT_NOTES));
  }
}

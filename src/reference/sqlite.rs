// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/reference/sqlite.rs - SQLite 参考资料库
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
  fmt,
  io::Write,
  path::Path,
  str::FromStr,
  sync::{Mutex, MutexGuard},
};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rusqlite::{Connection, OptionalExtension, Transaction, params, types::ValueRef};
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  reference::{ImportEntry, ReferenceError, ReferenceLookup, SpeciesDetails, Taxonomy, Treatment},
};

const SCHEMA: &str = "
DROP TABLE IF EXISTS species;
DROP TABLE IF EXISTS treatments;
DROP TABLE IF EXISTS taxonomy;

CREATE TABLE taxonomy (
  taxonomy_id INTEGER PRIMARY KEY AUTOINCREMENT,
  kingdom VARCHAR(50),
  phylum VARCHAR(50),
  class VARCHAR(50),
  family VARCHAR(50),
  order_rank VARCHAR(50)
);

CREATE TABLE treatments (
  treatments_id INTEGER PRIMARY KEY AUTOINCREMENT,
  drug_name VARCHAR(100) NOT NULL,
  dosage_instruction TEXT,
  notes TEXT
);

CREATE TABLE species (
  species_id INTEGER PRIMARY KEY AUTOINCREMENT,
  scientific_name VARCHAR(50) UNIQUE NOT NULL COLLATE NOCASE,
  common_name VARCHAR(50),
  habitat TEXT,
  description TEXT,
  taxonomy_id INTEGER REFERENCES taxonomy(taxonomy_id),
  treatments_id INTEGER REFERENCES treatments(treatments_id)
);
";

const FIND_SPECIES: &str = "
SELECT s.scientific_name, s.common_name, s.habitat, s.description,
       t.kingdom, t.phylum, t.class, t.order_rank, t.family,
       tr.drug_name, tr.dosage_instruction, tr.notes
FROM species s
JOIN taxonomy t ON s.taxonomy_id = t.taxonomy_id
JOIN treatments tr ON s.treatments_id = tr.treatments_id
WHERE s.scientific_name = ?1
";

/// 可导出的数据表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferenceTable {
  Taxonomy,
  Treatments,
  Species,
}

impl ReferenceTable {
  pub fn as_str(self) -> &'static str {
    match self {
      ReferenceTable::Taxonomy => "taxonomy",
      ReferenceTable::Treatments => "treatments",
      ReferenceTable::Species => "species",
    }
  }
}

impl fmt::Display for ReferenceTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ReferenceTable {
  type Err = ReferenceError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "taxonomy" => Ok(ReferenceTable::Taxonomy),
      "treatments" => Ok(ReferenceTable::Treatments),
      "species" => Ok(ReferenceTable::Species),
      other => Err(ReferenceError::UnknownTable(other.to_string())),
    }
  }
}

pub struct SqliteReferenceStore {
  conn: Mutex<Connection>,
}

impl FromUrlWithScheme for SqliteReferenceStore {
  const SCHEME: &'static str = "sqlite";
}

impl FromUrl for SqliteReferenceStore {
  type Error = ReferenceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReferenceError::SchemeMismatch);
    }
    Self::open(url.path())
  }
}

impl SqliteReferenceStore {
  pub fn open(path: impl AsRef<Path>) -> Result<Self, ReferenceError> {
    info!("打开参考资料库: {}", path.as_ref().display());
    Self::with_connection(Connection::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self, ReferenceError> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self, ReferenceError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>, ReferenceError> {
    self.conn.lock().map_err(|_| ReferenceError::LockPoisoned)
  }

  /// 删除并重建三张表
  pub fn create_schema(&self) -> Result<(), ReferenceError> {
    self.conn()?.execute_batch(SCHEMA)?;
    info!("参考资料表已重建");
    Ok(())
  }

  fn insert(tx: &Transaction<'_>, details: &SpeciesDetails) -> Result<i64, ReferenceError> {
    if details.scientific_name.trim().is_empty() {
      return Err(ReferenceError::Invalid("学名不能为空".to_string()));
    }
    if details.treatment.drug_name.trim().is_empty() {
      return Err(ReferenceError::Invalid(format!(
        "{} 缺少治疗药物",
        details.scientific_name
      )));
    }

    let Taxonomy {
      kingdom,
      phylum,
      class,
      order,
      family,
    } = &details.taxonomy;
    tx.execute(
      "INSERT INTO taxonomy (kingdom, phylum, class, family, order_rank) VALUES (?1, ?2, ?3, ?4, ?5)",
      params![kingdom, phylum, class, family, order],
    )?;
    let taxonomy_id = tx.last_insert_rowid();

    let Treatment {
      drug_name,
      dosage_instruction,
      notes,
    } = &details.treatment;
    tx.execute(
      "INSERT INTO treatments (drug_name, dosage_instruction, notes) VALUES (?1, ?2, ?3)",
      params![drug_name, dosage_instruction, notes],
    )?;
    let treatments_id = tx.last_insert_rowid();

    tx.execute(
      "INSERT INTO species (scientific_name, common_name, habitat, description, taxonomy_id, treatments_id)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
      params![
        details.scientific_name,
        details.common_name,
        details.habitat,
        details.description,
        taxonomy_id,
        treatments_id
      ],
    )?;
    Ok(tx.last_insert_rowid())
  }

  /// 在一个事务中写入物种、分类和治疗记录，任一步失败则全部回滚
  pub fn add_parasite(&self, details: &SpeciesDetails) -> Result<i64, ReferenceError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let species_id = Self::insert(&tx, details)?;
    tx.commit()?;
    info!("已添加物种 {}", details.scientific_name);
    Ok(species_id)
  }

  pub fn find(&self, scientific_name: &str) -> Result<Option<SpeciesDetails>, ReferenceError> {
    let conn = self.conn()?;
    let details = conn
      .query_row(FIND_SPECIES, params![scientific_name], |row| {
        Ok(SpeciesDetails {
          scientific_name: row.get(0)?,
          common_name: row.get(1)?,
          habitat: row.get(2)?,
          description: row.get(3)?,
          taxonomy: Taxonomy {
            kingdom: row.get(4)?,
            phylum: row.get(5)?,
            class: row.get(6)?,
            order: row.get(7)?,
            family: row.get(8)?,
          },
          treatment: Treatment {
            drug_name: row.get(9)?,
            dosage_instruction: row.get(10)?,
            notes: row.get(11)?,
          },
        })
      })
      .optional()?;
    debug!("查询物种 {}: {}", scientific_name, details.is_some());
    Ok(details)
  }

  /// 批量导入，全部成功才提交
  pub fn import_entries(&self, entries: Vec<ImportEntry>) -> Result<usize, ReferenceError> {
    let mut conn = self.conn()?;
    let tx = conn.transaction()?;
    let count = entries.len();
    for entry in entries {
      Self::insert(&tx, &SpeciesDetails::from(entry))?;
    }
    tx.commit()?;
    info!("导入物种 {} 条", count);
    Ok(count)
  }

  pub fn import_json(&self, path: impl AsRef<Path>) -> Result<usize, ReferenceError> {
    let entries: Vec<ImportEntry> = serde_json::from_slice(&std::fs::read(path)?)?;
    self.import_entries(entries)
  }

  /// 以带表头的 CSV 写出整张表
  pub fn write_csv<W: Write>(&self, table: ReferenceTable, mut writer: W) -> Result<usize, ReferenceError> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(&format!("SELECT * FROM {} ORDER BY 1", table.as_str()))?;

    let header: Vec<String> = stmt.column_names().iter().map(|name| csv_field(name)).collect();
    writeln!(writer, "{}", header.join(","))?;

    let columns = stmt.column_count();
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while let Some(row) = rows.next()? {
      let mut fields = Vec::with_capacity(columns);
      for idx in 0..columns {
        let field = match row.get_ref(idx)? {
          ValueRef::Null => String::new(),
          ValueRef::Integer(v) => v.to_string(),
          ValueRef::Real(v) => v.to_string(),
          ValueRef::Text(v) => csv_field(&String::from_utf8_lossy(v)),
          ValueRef::Blob(v) => BASE64.encode(v),
        };
        fields.push(field);
      }
      writeln!(writer, "{}", fields.join(","))?;
      count += 1;
    }
    writer.flush()?;
    Ok(count)
  }

  pub fn export_csv(&self, table: ReferenceTable, path: impl AsRef<Path>) -> Result<usize, ReferenceError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
    {
      std::fs::create_dir_all(parent)?;
    }
    let file = std::io::BufWriter::new(std::fs::File::create(path)?);
    let count = self.write_csv(table, file)?;
    info!("{} 表已导出 {} 行到 {}", table, count, path.display());
    Ok(count)
  }
}

/// RFC 4180 字段转义
fn csv_field(value: &str) -> String {
  if value.contains([',', '"', '\n', '\r']) {
    format!("\"{}\"", value.replace('"', "\"\""))
  } else {
    value.to_string()
  }
}

impl ReferenceLookup for SqliteReferenceStore {
  fn lookup(&self, scientific_name: &str) -> Result<Option<SpeciesDetails>, ReferenceError> {
    self.find(scientific_name)
  }
}

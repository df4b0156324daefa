// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/model/labels.rs - 类别名称表
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

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

const PARASITE_LABELS: &str = include_str!("../../labels/parasite.toml");

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Label table parse error: {0}")]
  ParseError(#[from] toml::de::Error),
  #[error("Label table is empty")]
  Empty,
}

/// 类别索引到名称的映射表
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassNames {
  names: Vec<String>,
}

impl ClassNames {
  pub fn new(names: Vec<String>) -> Self {
    Self { names }
  }

  /// 内置的寄生虫类别表
  pub fn parasite() -> Self {
    Self::from_toml_str(PARASITE_LABELS).expect("无法解析内置的类别表")
  }

  pub fn from_toml_str(content: &str) -> Result<Self, LabelError> {
    let table: ClassNames = toml::from_str(content)?;
    if table.names.is_empty() {
      return Err(LabelError::Empty);
    }
    Ok(table)
  }

  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let content = std::fs::read_to_string(path)?;
    Self::from_toml_str(&content)
  }

  pub fn get(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }

  /// 查询类别名称，表中不存在时返回占位名称
  pub fn resolve(&self, class_id: u32) -> String {
    match self.get(class_id) {
      Some(name) => name.to_string(),
      None => format!("class {}", class_id),
    }
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
    self
      .names
      .iter()
      .enumerate()
      .map(|(id, name)| (id as u32, name.as_str()))
  }
}

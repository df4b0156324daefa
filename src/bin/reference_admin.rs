// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/bin/reference_admin.rs - 参考资料库管理工具
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

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use chongjian::{
  FromUrl,
  reference::{ReferenceTable, SpeciesDetails, SqliteReferenceStore, Taxonomy, Treatment},
};

/// Chongjian 参考资料库管理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// 参考资料库，例如 sqlite:///data/parasites.db
  #[arg(long, value_name = "DATABASE")]
  database: Url,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  /// 删除并重建全部表
  Init,
  /// 添加一个物种
  Add(AddArgs),
  /// 从 JSON 文件批量导入
  Import {
    #[arg(value_name = "FILE")]
    file: PathBuf,
  },
  /// 按学名查询
  Show {
    #[arg(value_name = "NAME")]
    name: String,
  },
  /// 把一张表导出为 CSV
  Export {
    /// taxonomy、treatments 或 species
    #[arg(value_name = "TABLE")]
    table: ReferenceTable,
    #[arg(value_name = "FILE")]
    file: PathBuf,
  },
}

#[derive(Args, Debug)]
struct AddArgs {
  #[arg(long)]
  scientific_name: String,
  #[arg(long)]
  common_name: Option<String>,
  #[arg(long)]
  habitat: Option<String>,
  #[arg(long)]
  description: Option<String>,
  #[arg(long)]
  kingdom: Option<String>,
  #[arg(long)]
  phylum: Option<String>,
  #[arg(long)]
  class: Option<String>,
  #[arg(long)]
  order: Option<String>,
  #[arg(long)]
  family: Option<String>,
  #[arg(long)]
  drug_name: String,
  #[arg(long)]
  dosage: Option<String>,
  #[arg(long)]
  notes: Option<String>,
}

impl From<AddArgs> for SpeciesDetails {
  fn from(args: AddArgs) -> Self {
    SpeciesDetails {
      scientific_name: args.scientific_name,
      common_name: args.common_name,
      habitat: args.habitat,
      description: args.description,
      taxonomy: Taxonomy {
        kingdom: args.kingdom,
        phylum: args.phylum,
        class: args.class,
        order: args.order,
        family: args.family,
      },
      treatment: Treatment {
        drug_name: args.drug_name,
        dosage_instruction: args.dosage,
        notes: args.notes,
      },
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let cli = Cli::parse();
  let store = SqliteReferenceStore::from_url(&cli.database)?;

  match cli.command {
    Commands::Init => store.create_schema()?,
    Commands::Add(args) => {
      let species_id = store.add_parasite(&SpeciesDetails::from(args))?;
      info!("物种编号: {}", species_id);
    }
    Commands::Import { file } => {
      let count = store.import_json(&file)?;
      info!("从 {} 导入 {} 条记录", file.display(), count);
    }
    Commands::Show { name } => match store.find(&name)? {
      Some(details) => println!("{}", serde_json::to_string_pretty(&details)?),
      None => bail!("未找到物种: {}", name),
    },
    Commands::Export { table, file } => {
      let count = store.export_csv(table, &file)?;
      info!("{} 表导出 {} 行到 {}", table, count, file.display());
    }
  }

  Ok(())
}

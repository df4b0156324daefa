// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/explain/command.rs - 调用外部程序生成热力图
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
  process::Stdio,
  time::Duration,
};

use image::RgbImage;
use tokio::process::Command;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value, query_values,
  explain::{Explain, ExplainError, ExplainOutput, ExplainParams, ScopedTempDir},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const STDERR_TAIL_LINES: usize = 20;
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

/// 外部热力图程序
///
/// 调用方式为 `<program> <args...> --image <path> --output <dir> --method <M>
/// --layers <l1,l2,...> --conf <c> [--renormalize] [--show-box]`，
/// 程序把结果图像写入输出目录，按文件名排序后作为一组结果返回。
#[derive(Debug, Clone)]
pub struct CommandExplainer {
  program: PathBuf,
  args: Vec<String>,
  timeout: Duration,
}

impl FromUrlWithScheme for CommandExplainer {
  const SCHEME: &'static str = "command";
}

impl FromUrl for CommandExplainer {
  type Error = ExplainError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ExplainError::SchemeMismatch);
    }

    let timeout = match query_value(url, "timeout") {
      Some(raw) => raw
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs > 0.0)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ExplainError::InvalidParams(format!("参数 timeout 无效: {}", raw)))?,
      None => DEFAULT_TIMEOUT,
    };

    Ok(CommandExplainer {
      program: PathBuf::from(url.path()),
      args: query_values(url, "arg"),
      timeout,
    })
  }
}

impl CommandExplainer {
  pub fn new(program: impl AsRef<Path>, args: Vec<String>, timeout: Duration) -> Self {
    Self {
      program: program.as_ref().to_path_buf(),
      args,
      timeout,
    }
  }

  fn command(&self, image_path: &Path, output_dir: &Path, params: &ExplainParams) -> Command {
    let layers = params
      .layers
      .iter()
      .map(u32::to_string)
      .collect::<Vec<_>>()
      .join(",");

    let mut command = Command::new(&self.program);
    command
      .args(&self.args)
      .arg("--image")
      .arg(image_path)
      .arg("--output")
      .arg(output_dir)
      .arg("--method")
      .arg(params.method.as_str())
      .arg("--layers")
      .arg(layers)
      .arg("--conf")
      .arg(params.conf_threshold.to_string());
    if params.renormalize {
      command.arg("--renormalize");
    }
    if params.show_box {
      command.arg("--show-box");
    }

    // 请求取消或超时时 future 被丢弃，子进程随之被杀死
    command
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    command
  }
}

fn stderr_tail(stderr: &[u8]) -> String {
  let text = String::from_utf8_lossy(stderr);
  let lines: Vec<&str> = text.lines().collect();
  lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n")
}

fn is_image_file(path: &Path) -> bool {
  path
    .extension()
    .and_then(|ext| ext.to_str())
    .is_some_and(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

async fn collect_images(dir: &Path) -> Result<Vec<RgbImage>, ExplainError> {
  let mut entries = tokio::fs::read_dir(dir).await?;
  let mut paths = Vec::new();
  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    if is_image_file(&path) {
      paths.push(path);
    }
  }
  paths.sort();
  debug!("外部程序输出图像 {} 张", paths.len());

  let images = tokio::task::spawn_blocking(move || {
    paths
      .iter()
      .map(|path| image::open(path).map(|image| image.to_rgb8()))
      .collect::<Result<Vec<_>, _>>()
  })
  .await??;
  Ok(images)
}

impl Explain for CommandExplainer {
  async fn explain(
    &self,
    image_path: &Path,
    params: &ExplainParams,
  ) -> Result<ExplainOutput, ExplainError> {
    let output_dir = ScopedTempDir::new()?;
    let mut command = self.command(image_path, output_dir.path(), params);

    info!("调用外部热力图程序: {}", self.program.display());
    let child = command.spawn()?;
    let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
      Ok(output) => output?,
      Err(_) => {
        warn!("外部热力图程序超时: {:?}", self.timeout);
        return Err(ExplainError::Timeout(self.timeout));
      }
    };

    if !output.status.success() {
      return Err(ExplainError::CommandFailed {
        status: output.status.to_string(),
        stderr: stderr_tail(&output.stderr),
      });
    }

    let images = collect_images(output_dir.path()).await?;
    Ok(ExplainOutput::Batch(images))
  }
}

// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/main.rs - 检测服务主程序
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

use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use chongjian::{
  FromUrl,
  explain::{CamMethod, ExplainParams, ExplainerWrapper},
  model::{DetectionService, ModelWrapper},
  pipeline::{Pipeline, PipelineConfig},
  report::ReportConfig,
  server,
  species::DEFAULT_UNKNOWN_BELOW,
};

/// Chongjian 检测服务参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 监听地址
  #[arg(long, default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub bind: SocketAddr,
  /// 检测模型，例如 onnx:///models/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 热力图后端，例如 eigencam:///models/features.onnx 或 command:///usr/bin/python3?arg=...
  #[arg(long, value_name = "EXPLAINER")]
  pub explainer: Option<Url>,
  /// 请求头 access_token 必须携带的密钥
  #[arg(long, env = "CHONGJIAN_API_KEY", hide_env_values = true, value_name = "KEY")]
  pub api_key: String,
  /// 低于该置信度的检测结果显示为未知物种
  #[arg(long, default_value_t = DEFAULT_UNKNOWN_BELOW, value_name = "THRESHOLD")]
  pub unknown_threshold: f32,
  /// 默认热力图方法，未指定时由后端决定
  #[arg(long, value_name = "METHOD")]
  pub explain_method: Option<CamMethod>,
  /// 默认目标层，逗号分隔
  #[arg(long, default_value = "18,20,22", value_name = "LAYERS")]
  pub explain_layers: String,
  /// 热力图中检测框的置信度阈值
  #[arg(long, default_value = "0.2", value_name = "THRESHOLD")]
  pub explain_conf: f32,
  /// 只在检测框内重新归一化热力图
  #[arg(long)]
  pub explain_renormalize: bool,
  /// 在热力图上绘制检测框
  #[arg(long)]
  pub explain_show_box: bool,
  /// 参考资料库，例如 sqlite:///data/parasites.db
  #[arg(long, value_name = "DATABASE")]
  pub reference_db: Option<Url>,
  /// 单次上传的最大体积（MiB）
  #[arg(long, default_value = "20", value_name = "MIB")]
  pub max_upload_mb: usize,
}

fn load_model(url: &Url) -> DetectionService<ModelWrapper> {
  info!("正在加载模型: {}", url);
  match ModelWrapper::from_url(url) {
    Ok(model) => {
      info!("模型加载完成");
      DetectionService::ready(model)
    }
    Err(e) => {
      error!("模型加载失败，服务将以未就绪状态启动: {}", e);
      DetectionService::unavailable()
    }
  }
}

fn load_explainer(url: Option<&Url>) -> Result<Option<ExplainerWrapper>> {
  let Some(url) = url else {
    warn!("未配置热力图后端，热力图请求将失败");
    return Ok(None);
  };
  info!("热力图后端: {}", url);
  Ok(Some(ExplainerWrapper::from_url(url)?))
}

#[cfg(feature = "reference_sqlite")]
fn attach_reference<M, E>(pipeline: Pipeline<M, E>, url: Option<&Url>) -> Result<Pipeline<M, E>>
where
  M: chongjian::model::Model + 'static,
  E: chongjian::explain::Explain + 'static,
{
  use std::sync::Arc;

  use chongjian::reference::SqliteReferenceStore;

  match url {
    Some(url) => {
      let store = SqliteReferenceStore::from_url(url)?;
      Ok(pipeline.with_reference(Arc::new(store)))
    }
    None => Ok(pipeline),
  }
}

#[cfg(not(feature = "reference_sqlite"))]
fn attach_reference<M, E>(pipeline: Pipeline<M, E>, url: Option<&Url>) -> Result<Pipeline<M, E>> {
  if url.is_some() {
    warn!("未启用 reference_sqlite 特性，忽略参考资料库");
  }
  Ok(pipeline)
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("收到中断信号，准备退出..."),
    Err(e) => error!("无法监听中断信号: {}", e),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();

  info!("监听地址: {}", args.bind);
  info!("模型: {}", args.model);

  let detection = load_model(&args.model);
  let explainer = load_explainer(args.explainer.as_ref())?;

  let method = args
    .explain_method
    .or_else(|| explainer.as_ref().map(ExplainerWrapper::default_method))
    .unwrap_or(CamMethod::GradCAM);
  let explain = ExplainParams {
    method,
    layers: ExplainParams::parse_layers(&args.explain_layers)?,
    conf_threshold: args.explain_conf,
    renormalize: args.explain_renormalize,
    show_box: args.explain_show_box,
  };
  explain.validate()?;
  info!("默认热力图参数: {:?}", explain);

  let config = PipelineConfig {
    api_key: args.api_key,
    report: ReportConfig {
      unknown_below: args.unknown_threshold,
    },
    explain,
  };
  let pipeline = Pipeline::new(detection, explainer, config);
  let pipeline = attach_reference(pipeline, args.reference_db.as_ref())?;

  let app = server::router(pipeline, args.max_upload_mb * 1024 * 1024);
  let listener = tokio::net::TcpListener::bind(args.bind).await?;
  info!("服务已启动: http://{}", listener.local_addr()?);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  info!("服务已退出");
  Ok(())
}

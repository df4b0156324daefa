// 该文件是 Chongjian （虫鉴） 项目的一部分。
// src/server.rs - HTTP 接口
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

use axum::{
  Json, Router,
  extract::{
    DefaultBodyLimit, Multipart, Query, State, multipart::MultipartRejection,
    rejection::QueryRejection,
  },
  http::HeaderMap,
  response::{IntoResponse, Response},
  routing::{get, post},
};
use serde_json::{Value, json};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::{
  explain::Explain,
  model::Model,
  pipeline::{
    ExplainOverrides, ExplainResponse, Pipeline, PipelineError, PredictOptions, PredictResponse, Stage,
  },
};

/// 携带共享密钥的请求头
pub const ACCESS_TOKEN_HEADER: &str = "access_token";
/// 上传文件所在的表单字段
pub const UPLOAD_FIELD: &str = "file";
pub const DEFAULT_BODY_LIMIT: usize = 20 * 1024 * 1024;

impl IntoResponse for PipelineError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      error!("请求失败 ({}): {}", status, self);
    } else {
      warn!("请求被拒绝 ({}): {}", status, self);
    }
    (status, Json(json!({ "detail": self.to_string() }))).into_response()
  }
}

/// 构造路由，`body_limit` 为单个请求体的最大字节数
pub fn router<M, E>(pipeline: Pipeline<M, E>, body_limit: usize) -> Router
where
  M: Model + 'static,
  E: Explain + 'static,
{
  Router::new()
    .route("/", get(home))
    .route("/health", get(health::<M, E>))
    .route("/predict", post(predict::<M, E>))
    .route("/explain", post(explain::<M, E>))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(pipeline)
}

async fn home() -> Json<Value> {
  Json(json!({
    "status": "success",
    "message": "YOLO Parasites API is running",
  }))
}

async fn health<M, E>(State(pipeline): State<Pipeline<M, E>>) -> Json<Value>
where
  M: Model + 'static,
  E: Explain + 'static,
{
  Json(json!({
    "status": "healthy",
    "model_loaded": pipeline.model_loaded(),
    "explainer_configured": pipeline.explainer_configured(),
  }))
}

/// 在读取任何上传内容之前完成鉴权与模型检查
fn admit<M, E>(pipeline: &Pipeline<M, E>, headers: &HeaderMap) -> Result<(), PipelineError>
where
  M: Model + 'static,
  E: Explain + 'static,
{
  let presented = headers
    .get(ACCESS_TOKEN_HEADER)
    .and_then(|value| value.to_str().ok());
  pipeline.authorize(presented)?;
  pipeline.ensure_ready()
}

fn rejected(message: impl ToString) -> PipelineError {
  PipelineError::Unclassified {
    stage: Stage::Received,
    message: message.to_string(),
  }
}

async fn read_upload(
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Vec<u8>, PipelineError> {
  let mut multipart = multipart.map_err(|e| rejected(e.body_text()))?;

  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| rejected(format!("Multipart error: {e}")))?
  {
    if field.name() == Some(UPLOAD_FIELD) {
      let data = field
        .bytes()
        .await
        .map_err(|e| rejected(format!("Failed to read upload: {e}")))?;
      info!("收到上传文件 {} 字节", data.len());
      return Ok(data.to_vec());
    }
  }
  Err(rejected("No file uploaded"))
}

async fn predict<M, E>(
  State(pipeline): State<Pipeline<M, E>>,
  headers: HeaderMap,
  options: Result<Query<PredictOptions>, QueryRejection>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, PipelineError>
where
  M: Model + 'static,
  E: Explain + 'static,
{
  admit(&pipeline, &headers)?;
  let Query(options) = options.map_err(|e| rejected(e.body_text()))?;
  options.validate()?;
  let bytes = read_upload(multipart).await?;
  let response = pipeline.predict(bytes, options).await?;
  Ok(Json(response))
}

async fn explain<M, E>(
  State(pipeline): State<Pipeline<M, E>>,
  headers: HeaderMap,
  overrides: Result<Query<ExplainOverrides>, QueryRejection>,
  multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ExplainResponse>, PipelineError>
where
  M: Model + 'static,
  E: Explain + 'static,
{
  admit(&pipeline, &headers)?;
  let Query(overrides) = overrides.map_err(|e| rejected(e.body_text()))?;
  let params = overrides.apply(&pipeline.config().explain)?;
  let bytes = read_upload(multipart).await?;
  let response = pipeline.explain(bytes, params).await?;
  Ok(Json(response))
}

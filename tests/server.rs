// 该文件是 Chongjian （虫鉴） 项目的一部分。
// tests/server.rs - HTTP 接口测试
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

use std::{path::Path, sync::Arc};

use axum::{
  Router,
  body::Body,
  http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use image::{Rgb, RgbImage};
use serde_json::Value;
use tower::ServiceExt;

use chongjian::{
  explain::{Explain, ExplainError, ExplainOutput, ExplainParams},
  model::{ClassNames, DetectItem, DetectResult, DetectionService, Model, ModelError},
  output::encode::{decode_png_base64, encode_png},
  pipeline::{Pipeline, PipelineConfig},
  report::ReportConfig,
  server::{self, DEFAULT_BODY_LIMIT},
};

const KEY: &str = "test-key";
const BOUNDARY: &str = "chongjian-test-boundary";

struct FakeModel {
  names: Arc<ClassNames>,
}

impl Model for FakeModel {
  fn infer(&self, _: &RgbImage, confidence_threshold: f32) -> Result<DetectResult, ModelError> {
    let items = [
      DetectItem {
        class_id: 5,
        score: 0.85,
        bbox: [4.0, 4.0, 20.0, 20.0],
      },
      DetectItem {
        class_id: 6,
        score: 0.3,
        bbox: [22.0, 22.0, 30.0, 30.0],
      },
    ];
    Ok(DetectResult {
      items: items
        .into_iter()
        .filter(|item| item.score >= confidence_threshold)
        .collect(),
      names: self.names.clone(),
    })
  }

  fn class_names(&self) -> &Arc<ClassNames> {
    &self.names
  }
}

/// 成功时把输入图像原样返回
struct FakeExplainer {
  fail: bool,
}

impl Explain for FakeExplainer {
  async fn explain(&self, image_path: &Path, _: &ExplainParams) -> Result<ExplainOutput, ExplainError> {
    if self.fail {
      return Err(ExplainError::CommandFailed {
        status: "exit status: 1".into(),
        stderr: "CUDA out of memory".into(),
      });
    }
    Ok(ExplainOutput::Batch(vec![image::open(image_path)?.to_rgb8()]))
  }
}

fn app_with(model: Option<FakeModel>, explainer: Option<FakeExplainer>, body_limit: usize) -> Router {
  let config = PipelineConfig {
    api_key: KEY.to_string(),
    report: ReportConfig::default(),
    explain: ExplainParams::default(),
  };
  let pipeline = Pipeline::new(DetectionService::from_option(model), explainer, config);
  server::router(pipeline, body_limit)
}

fn app(explainer: Option<FakeExplainer>) -> Router {
  let model = FakeModel {
    names: Arc::new(ClassNames::parasite()),
  };
  app_with(Some(model), explainer, DEFAULT_BODY_LIMIT)
}

fn sample_image() -> RgbImage {
  RgbImage::from_pixel(32, 32, Rgb([120, 130, 140]))
}

fn multipart(field: &str, content: &[u8]) -> Vec<u8> {
  let mut body = format!(
    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"sample.png\"\r\nContent-Type: image/png\r\n\r\n"
  )
  .into_bytes();
  body.extend_from_slice(content);
  body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
  body
}

fn upload(uri: &str, key: Option<&str>, body: Vec<u8>) -> Request<Body> {
  let mut builder = Request::builder()
    .method("POST")
    .uri(uri)
    .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"));
  if let Some(key) = key {
    builder = builder.header("access_token", key);
  }
  builder.body(Body::from(body)).unwrap()
}

fn image_upload(uri: &str) -> Request<Body> {
  upload(uri, Some(KEY), multipart("file", &encode_png(&sample_image()).unwrap()))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
  let response = app.oneshot(request).await.unwrap();
  let status = response.status();
  let bytes = response.into_body().collect().await.unwrap().to_bytes();
  let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
  (status, json)
}

#[tokio::test]
async fn home_and_health() {
  let request = Request::get("/").body(Body::empty()).unwrap();
  let (status, json) = send(app(None), request).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(json["status"], "success");
  assert_eq!(json["message"], "YOLO Parasites API is running");

  let request = Request::get("/health").body(Body::empty()).unwrap();
  let (status, json) = send(app(Some(FakeExplainer { fail: false })), request).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(json["status"], "healthy");
  assert_eq!(json["model_loaded"], true);
  assert_eq!(json["explainer_configured"], true);

  let request = Request::get("/health").body(Body::empty()).unwrap();
  let (_, json) = send(app_with(None, None, DEFAULT_BODY_LIMIT), request).await;
  assert_eq!(json["model_loaded"], false);
  assert_eq!(json["explainer_configured"], false);
}

#[tokio::test]
async fn cors_allows_any_origin() {
  let request = Request::get("/")
    .header(header::ORIGIN, "http://localhost:3000")
    .body(Body::empty())
    .unwrap();
  let response = app(None).oneshot(request).await.unwrap();
  assert_eq!(
    response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
    "*"
  );
}

#[tokio::test]
async fn wrong_or_missing_key_is_forbidden() {
  let body = multipart("file", &encode_png(&sample_image()).unwrap());
  let (status, json) = send(app(None), upload("/predict", None, body.clone())).await;
  assert_eq!(status, StatusCode::FORBIDDEN);
  assert_eq!(json["detail"], "Access denied");

  let (status, _) = send(app(None), upload("/explain", Some("nope"), body)).await;
  assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn missing_model_fails_before_reading_the_upload() {
  // 请求体不是合法的 multipart，若先读取上传内容会得到 400
  for uri in ["/predict", "/explain"] {
    let request = Request::post(uri)
      .header("access_token", KEY)
      .body(Body::from("not a multipart body"))
      .unwrap();
    let app = app_with(None, Some(FakeExplainer { fail: false }), DEFAULT_BODY_LIMIT);
    let (status, json) = send(app, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["detail"], "Model not loaded. Please ensure the model file exists.");
  }
}

#[tokio::test]
async fn predict_returns_detections_and_heatmap() {
  let (status, json) = send(app(Some(FakeExplainer { fail: false })), image_upload("/predict")).await;
  assert_eq!(status, StatusCode::OK);

  assert_eq!(json["total_detections"], 1);
  assert_eq!(json["avg_confidence"], "85.0%");
  assert_eq!(json["unique_species"], 1);
  let detection = &json["detections"][0];
  assert_eq!(detection["index"], 1);
  assert_eq!(detection["name"], "Schistosoma");
  assert_eq!(detection["confidence_percentage"], "85.0%");
  assert_eq!(detection["confidence_emoji"], "🟢");
  assert!(json.get("heatmap_error").is_none());

  let annotated = decode_png_base64(json["image_base64"].as_str().unwrap()).unwrap();
  assert_eq!(annotated.dimensions(), (32, 32));
  let heatmap = decode_png_base64(json["image_heatmap"].as_str().unwrap()).unwrap();
  assert_eq!(heatmap, sample_image());
}

#[tokio::test]
async fn predict_honours_query_options() {
  let uri = "/predict?confidence_threshold=0.25&show_boxes=false&with_heatmap=false";
  let (status, json) = send(app(Some(FakeExplainer { fail: false })), image_upload(uri)).await;
  assert_eq!(status, StatusCode::OK);
  assert_eq!(json["total_detections"], 2);
  assert_eq!(json["detections"][1]["name"], "Unknown Species");
  assert_eq!(json["detections"][1]["confidence_emoji"], "🔴");
  assert!(json["image_heatmap"].is_null());

  let annotated = decode_png_base64(json["image_base64"].as_str().unwrap()).unwrap();
  assert_eq!(annotated, sample_image());
}

#[tokio::test]
async fn predict_rejects_out_of_range_threshold() {
  for threshold in ["1.5", "-0.1", "NaN"] {
    let uri = format!("/predict?confidence_threshold={threshold}");
    let (status, json) = send(app(Some(FakeExplainer { fail: false })), image_upload(&uri)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["detail"].as_str().unwrap().contains("置信度阈值"));
  }
}

#[tokio::test]
async fn heatmap_failure_keeps_the_detections() {
  let (status, json) = send(app(Some(FakeExplainer { fail: true })), image_upload("/predict")).await;
  assert_eq!(status, StatusCode::OK);
  assert!(json["image_heatmap"].is_null());
  assert!(
    json["heatmap_error"]
      .as_str()
      .unwrap()
      .contains("CUDA out of memory")
  );
  assert_eq!(json["total_detections"], 1);
  assert_eq!(json["detections"][0]["name"], "Schistosoma");
}

#[tokio::test]
async fn predict_without_explainer_still_succeeds() {
  let (status, json) = send(app(None), image_upload("/predict")).await;
  assert_eq!(status, StatusCode::OK);
  assert!(json["image_heatmap"].is_null());
  assert_eq!(json["heatmap_error"], "Explainer is not configured");
}

#[tokio::test]
async fn undecodable_upload_is_rejected() {
  let body = multipart("file", b"definitely not an image");
  let (status, json) = send(app(None), upload("/predict", Some(KEY), body)).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert!(json["detail"].as_str().unwrap().starts_with("Invalid image file"));
}

#[tokio::test]
async fn upload_must_use_the_file_field() {
  let body = multipart("image", &encode_png(&sample_image()).unwrap());
  let (status, json) = send(app(None), upload("/predict", Some(KEY), body)).await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
  assert_eq!(json["detail"], "Error processing image: No file uploaded");
}

#[tokio::test]
async fn oversized_uploads_are_rejected() {
  let model = FakeModel {
    names: Arc::new(ClassNames::parasite()),
  };
  let app = app_with(Some(model), None, 1024);
  let body = multipart("file", &vec![0u8; 8 * 1024]);
  let (status, _) = send(app, upload("/predict", Some(KEY), body)).await;
  assert!(status.is_client_error());
}

#[tokio::test]
async fn explain_endpoint_returns_only_the_heatmap() {
  let uri = "/explain?method=EigenCAM&layers=15,18&renormalize=true";
  let (status, json) = send(app(Some(FakeExplainer { fail: false })), image_upload(uri)).await;
  assert_eq!(status, StatusCode::OK);
  let heatmap = decode_png_base64(json["image_heatmap"].as_str().unwrap()).unwrap();
  assert_eq!(heatmap, sample_image());
  assert!(json.get("detections").is_none());
}

#[tokio::test]
async fn explain_endpoint_failures() {
  let (status, json) = send(app(Some(FakeExplainer { fail: true })), image_upload("/explain")).await;
  assert_eq!(status, StatusCode::BAD_GATEWAY);
  assert!(json["detail"].as_str().unwrap().starts_with("Heatmap generation failed"));

  let (status, _) = send(app(None), image_upload("/explain")).await;
  assert_eq!(status, StatusCode::BAD_GATEWAY);

  let (status, _) = send(
    app(Some(FakeExplainer { fail: false })),
    image_upload("/explain?method=ScoreCAM"),
  )
  .await;
  assert_eq!(status, StatusCode::BAD_REQUEST);
}

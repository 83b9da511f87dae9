use crate::{config::InferenceConfig, frame::content_type_for};
use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde::Deserialize;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::instrument;

/// One detected object, top-left anchored, in source-image pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub class_name: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferenceMetadata {
    pub image_width: u32,
    pub image_height: u32,
    pub inference_time_ms: u64,
    pub detection_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceResult {
    Success {
        detections: Vec<BoundingBox>,
        metadata: InferenceMetadata,
    },
    Error {
        message: String,
    },
}

impl InferenceResult {
    pub fn error(message: impl Into<String>) -> Self {
        InferenceResult::Error {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, InferenceResult::Success { .. })
    }

    pub fn into_detections(self) -> Vec<BoundingBox> {
        match self {
            InferenceResult::Success { detections, .. } => detections,
            InferenceResult::Error { .. } => Vec::new(),
        }
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync + 'static {
    /// Runs detection on one frame. Failures come back as
    /// `InferenceResult::Error`, never as a panic or an `Err`.
    async fn invoke(&self, image_bytes: &[u8], is_valid_image: bool) -> InferenceResult;
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),
    #[error("Inference request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Inference service returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("Failed to parse inference response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{0}")]
    Service(String),
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    success: bool,
    #[serde(default)]
    predictions: Vec<Prediction>,
    #[serde(default)]
    image: ImageInfo,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(rename = "class")]
    class_name: String,
    confidence: f32,
    #[serde(rename = "box")]
    region: Region,
}

#[derive(Debug, Deserialize)]
struct Region {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
}

#[derive(Debug, Deserialize, Default)]
struct ImageInfo {
    width: u32,
    height: u32,
}

impl From<Prediction> for BoundingBox {
    fn from(prediction: Prediction) -> Self {
        let Region { x1, y1, x2, y2 } = prediction.region;
        // Spans are taken on the truncated corners in f64 so they cannot overflow i32.
        let (x1, y1, x2, y2) = (x1.trunc(), y1.trunc(), x2.trunc(), y2.trunc());
        let width = to_pixels(x2 - x1);
        let height = to_pixels(y2 - y1);
        let (x1, y1) = (to_pixels(x1), to_pixels(y1));
        if width <= 0 || height <= 0 {
            tracing::debug!(
                "Degenerate box for {}: ({}, {})-({}, {})",
                prediction.class_name,
                x1,
                y1,
                x2,
                y2
            );
        }
        BoundingBox {
            x: x1,
            y: y1,
            width,
            height,
            class_name: prediction.class_name,
            confidence: prediction.confidence,
        }
    }
}

/// Saturating conversion; NaN maps to 0.
fn to_pixels(value: f64) -> i32 {
    value.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

#[derive(Debug, Clone)]
pub struct HttpInferenceClient {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInferenceClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        Self::with_timeouts(
            &config.endpoint,
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn with_timeouts(
        endpoint: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(InferenceError::ClientBuild)?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }

    async fn call_endpoint(&self, image_bytes: &[u8]) -> Result<ServiceResponse, InferenceError> {
        let content_type = content_type_for(image_bytes);
        tracing::debug!(
            "Invoking {} with {} bytes of {}",
            self.endpoint,
            image_bytes.len(),
            content_type
        );

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::ACCEPT, "application/json")
            .body(image_bytes.to_vec())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<ServiceResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or(body);
            return Err(InferenceError::Status { status, message });
        }

        let parsed: ServiceResponse = serde_json::from_str(&body)?;
        if !parsed.success {
            return Err(InferenceError::Service(
                parsed
                    .error
                    .unwrap_or_else(|| "Unknown error from inference service".to_string()),
            ));
        }

        Ok(parsed)
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    #[instrument(skip(self, image_bytes), fields(bytes = image_bytes.len()))]
    async fn invoke(&self, image_bytes: &[u8], is_valid_image: bool) -> InferenceResult {
        if !is_valid_image || image_bytes.is_empty() {
            return InferenceResult::error("Unsupported or missing image format");
        }

        let start = Instant::now();
        let response = match self.call_endpoint(image_bytes).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Error invoking inference endpoint: {}", e);
                return InferenceResult::error(format!("Inference failed: {}", e));
            }
        };
        let inference_time_ms = start.elapsed().as_millis() as u64;

        let detections: Vec<BoundingBox> = response
            .predictions
            .into_iter()
            .map(BoundingBox::from)
            .collect();

        tracing::debug!(
            "Inference returned {} detections in {}ms",
            detections.len(),
            inference_time_ms
        );

        InferenceResult::Success {
            metadata: InferenceMetadata {
                image_width: response.image.width,
                image_height: response.image.height,
                inference_time_ms,
                detection_count: detections.len(),
            },
            detections,
        }
    }
}

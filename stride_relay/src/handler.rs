use crate::{
    calibration::CalibrationCache,
    distance::DistanceEstimator,
    frame::FrameRequest,
    inference::{InferenceClient, InferenceResult},
    publisher::{ChannelPush, FramePayload, OutboundMessage, ResponsePublisher},
    telemetry::Metrics,
};
use axum::http::StatusCode;
use serde::Deserialize;
use std::{sync::Arc, time::Instant};
use tracing::instrument;

pub const FRAME_ROUTE: &str = "frame";
pub const DEFAULT_ROUTE: &str = "$default";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub connection_id: String,
    #[serde(default = "default_route")]
    pub route_key: String,
    #[serde(default)]
    pub domain_name: String,
    #[serde(default)]
    pub stage: String,
}

fn default_route() -> String {
    DEFAULT_ROUTE.to_string()
}

/// One message received on a client's duplex channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub request_context: RequestContext,
    #[serde(default)]
    pub body: Option<String>,
}

impl InboundEvent {
    pub fn new(
        connection_id: &str,
        route_key: &str,
        domain_name: &str,
        stage: &str,
        body: Option<String>,
    ) -> Self {
        Self {
            request_context: RequestContext {
                connection_id: connection_id.to_string(),
                route_key: route_key.to_string(),
                domain_name: domain_name.to_string(),
                stage: stage.to_string(),
            },
            body,
        }
    }

    pub fn callback_address(&self) -> String {
        format!(
            "https://{}/{}",
            self.request_context.domain_name, self.request_context.stage
        )
    }
}

/// Transport-level acknowledgment. Says nothing about whether the push
/// reached the client.
#[derive(Debug, Clone, PartialEq)]
pub struct Acknowledgment {
    pub status: StatusCode,
    pub body: String,
}

impl Acknowledgment {
    fn ok(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.to_string(),
        }
    }

    fn bad_request(body: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: body.to_string(),
        }
    }
}

pub struct FrameHandler<I: InferenceClient, P: ChannelPush> {
    calibration: Arc<CalibrationCache>,
    inference: I,
    estimator: DistanceEstimator,
    publisher: ResponsePublisher<P>,
    metrics: Arc<Metrics>,
}

impl<I: InferenceClient, P: ChannelPush> FrameHandler<I, P> {
    pub fn new(
        calibration: Arc<CalibrationCache>,
        inference: I,
        estimator: DistanceEstimator,
        channel: P,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            calibration,
            inference,
            estimator,
            publisher: ResponsePublisher::new(channel, metrics.clone()),
            metrics,
        }
    }

    #[instrument(
        skip(self, event),
        fields(
            connection_id = %event.request_context.connection_id,
            route = %event.request_context.route_key
        )
    )]
    pub async fn handle(&self, event: &InboundEvent) -> Acknowledgment {
        self.calibration.load_if_needed().await;
        self.metrics
            .record_calibration_entries(self.calibration.entries());

        let context = &event.request_context;
        let callback_address = event.callback_address();
        self.metrics.record_frame(&context.route_key);

        if context.route_key != FRAME_ROUTE {
            tracing::warn!("Unrecognized route {}", context.route_key);
            let payload = OutboundMessage::error(format!(
                "Unrecognized action '{}'. Send frames with action '{}'.",
                context.route_key, FRAME_ROUTE
            ));
            self.publisher
                .publish(&context.connection_id, &callback_address, &payload)
                .await;
            return Acknowledgment::ok("Unrecognized action");
        }

        tracing::debug!("Processing frame");
        let frame = FrameRequest::decode(
            &context.connection_id,
            &callback_address,
            event.body.as_deref(),
        );
        if frame.empty_frame {
            tracing::warn!("Received empty frame");
            return Acknowledgment::bad_request("Empty frame");
        }

        let start = Instant::now();
        let result = self
            .inference
            .invoke(&frame.image_bytes, frame.is_valid_image())
            .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            InferenceResult::Success { metadata, .. } => {
                self.metrics.record_inference_duration(elapsed_ms, "success");
                tracing::debug!(
                    "{} detections on {}x{} image",
                    metadata.detection_count,
                    metadata.image_width,
                    metadata.image_height
                );
            }
            InferenceResult::Error { message } => {
                self.metrics.record_inference_duration(elapsed_ms, "error");
                tracing::info!("No detections for frame: {}", message);
            }
        }

        let objects = self
            .estimator
            .estimate(&self.calibration, result.into_detections());
        let payload = OutboundMessage::Frame(FramePayload::new(
            frame.frame_size(),
            frame.is_valid_image(),
            &objects,
        ));
        self.publisher
            .publish(&frame.connection_id, &frame.callback_address, &payload)
            .await;

        Acknowledgment::ok("OK")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        calibration::{CalibrationRecord, CalibrationStore, StoreError},
        config::CalibrationConfig,
        inference::{BoundingBox, InferenceMetadata},
        publisher::PublishError,
    };
    use async_trait::async_trait;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use parking_lot::Mutex;
    use prometheus::{Encoder, TextEncoder};
    use serde_json::{json, Value};
    use std::path::PathBuf;

    #[derive(Clone)]
    struct MockInference {
        result: InferenceResult,
        calls: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
    }

    impl MockInference {
        fn returning(result: InferenceResult) -> Self {
            Self {
                result,
                calls: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl InferenceClient for MockInference {
        async fn invoke(&self, image_bytes: &[u8], is_valid_image: bool) -> InferenceResult {
            self.calls.lock().push((image_bytes.to_vec(), is_valid_image));
            self.result.clone()
        }
    }

    #[derive(Clone, Default)]
    struct MockChannel {
        pushes: Arc<Mutex<Vec<(String, String, String)>>>,
        fail: bool,
    }

    impl MockChannel {
        fn messages(&self) -> Vec<Value> {
            self.pushes
                .lock()
                .iter()
                .map(|(_, _, message)| serde_json::from_str(message).unwrap())
                .collect()
        }
    }

    #[async_trait]
    impl ChannelPush for MockChannel {
        async fn push(
            &self,
            connection_id: &str,
            callback_address: &str,
            message: &str,
        ) -> Result<(), PublishError> {
            self.pushes.lock().push((
                connection_id.to_string(),
                callback_address.to_string(),
                message.to_string(),
            ));
            if self.fail {
                return Err(PublishError::Gone);
            }
            Ok(())
        }
    }

    struct PersonOnlyStore;

    #[async_trait]
    impl CalibrationStore for PersonOnlyStore {
        async fn scan(&self) -> Result<Vec<CalibrationRecord>, StoreError> {
            let record = json!({"class_name": "person", "avg_height_meters": "1.7"});
            Ok(record.as_object().cloned().into_iter().collect())
        }
    }

    fn calibration() -> Arc<CalibrationCache> {
        let config = CalibrationConfig {
            table_path: PathBuf::from("unused.json"),
            default_class: "person".to_string(),
            default_height_meters: 1.7,
            focal_length: 800.0,
        };
        Arc::new(CalibrationCache::new(PersonOnlyStore, &config))
    }

    fn person_detection() -> InferenceResult {
        InferenceResult::Success {
            detections: vec![BoundingBox {
                x: 320,
                y: 320,
                width: 200,
                height: 640,
                class_name: "person".to_string(),
                confidence: 0.95,
            }],
            metadata: InferenceMetadata {
                image_width: 1280,
                image_height: 960,
                inference_time_ms: 42,
                detection_count: 1,
            },
        }
    }

    fn handler(
        inference: MockInference,
        channel: MockChannel,
    ) -> FrameHandler<MockInference, MockChannel> {
        FrameHandler::new(
            calibration(),
            inference,
            DistanceEstimator::new(800.0),
            channel,
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn frame_event(body: Option<String>) -> InboundEvent {
        InboundEvent::new("test-conn-id", FRAME_ROUTE, "test.api", "prod", body)
    }

    fn jpeg_body() -> String {
        let image = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        format!(r#"{{"action":"frame", "body":"{}"}}"#, STANDARD.encode(image))
    }

    #[tokio::test]
    async fn test_end_to_end_distance() {
        let inference = MockInference::returning(person_detection());
        let channel = MockChannel::default();
        let handler = handler(inference.clone(), channel.clone());

        let ack = handler.handle(&frame_event(Some(jpeg_body()))).await;

        assert_eq!(ack.status, StatusCode::OK);
        assert_eq!(inference.calls.lock().len(), 1);
        assert!(inference.calls.lock()[0].1);

        let pushes = channel.pushes.lock().clone();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "test-conn-id");
        assert_eq!(pushes[0].1, "https://test.api/prod");
        assert_eq!(
            channel.messages()[0],
            json!({
                "frameSize": 6,
                "valid": true,
                "estimatedDistances": [{"className": "person", "distance": "2.125"}]
            })
        );
    }

    #[tokio::test]
    async fn test_inference_failure_still_publishes() {
        let inference = MockInference::returning(InferenceResult::error("timeout"));
        let channel = MockChannel::default();
        let handler = handler(inference, channel.clone());

        let ack = handler.handle(&frame_event(Some(jpeg_body()))).await;

        assert_eq!(ack.status, StatusCode::OK);
        assert_eq!(
            channel.messages(),
            vec![json!({"frameSize": 6, "valid": true, "estimatedDistances": []})]
        );
    }

    #[tokio::test]
    async fn test_inference_duration_labels_outcome() {
        let failing = handler(
            MockInference::returning(InferenceResult::error("timeout")),
            MockChannel::default(),
        );
        failing.handle(&frame_event(Some(jpeg_body()))).await;

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&failing.metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("inference_duration_ms"));
        assert!(text.contains(r#"outcome="error""#));
        assert!(!text.contains(r#"outcome="success""#));
    }

    #[tokio::test]
    async fn test_empty_frame_short_circuits() {
        let inference = MockInference::returning(person_detection());
        let channel = MockChannel::default();
        let handler = handler(inference.clone(), channel.clone());

        let ack = handler.handle(&frame_event(Some("{}".to_string()))).await;
        assert_eq!(ack.status, StatusCode::BAD_REQUEST);

        let ack = handler.handle(&frame_event(None)).await;
        assert_eq!(ack.status, StatusCode::BAD_REQUEST);

        assert!(inference.calls.lock().is_empty());
        assert!(channel.pushes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_route_publishes_error() {
        let inference = MockInference::returning(person_detection());
        let channel = MockChannel::default();
        let handler = handler(inference.clone(), channel.clone());

        let event = InboundEvent::new(
            "test-conn-id",
            DEFAULT_ROUTE,
            "test.api",
            "prod",
            Some(jpeg_body()),
        );
        let ack = handler.handle(&event).await;

        assert_eq!(ack.status, StatusCode::OK);
        assert!(inference.calls.lock().is_empty());

        let messages = channel.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0]["error"]
            .as_str()
            .unwrap()
            .contains("Unrecognized action '$default'"));
    }

    #[tokio::test]
    async fn test_invalid_image_reports_invalid_frame() {
        let inference = MockInference::returning(InferenceResult::error("unsupported"));
        let channel = MockChannel::default();
        let handler = handler(inference.clone(), channel.clone());

        let body = format!(
            r#"{{"action":"frame","body":"{}"}}"#,
            STANDARD.encode(b"fake_image_bytes")
        );
        let ack = handler.handle(&frame_event(Some(body))).await;

        assert_eq!(ack.status, StatusCode::OK);
        assert!(!inference.calls.lock()[0].1);
        assert_eq!(
            channel.messages(),
            vec![json!({"frameSize": 16, "valid": false, "estimatedDistances": []})]
        );
    }

    #[tokio::test]
    async fn test_bad_base64_reports_zero_size() {
        let inference = MockInference::returning(InferenceResult::error("unsupported"));
        let channel = MockChannel::default();
        let handler = handler(inference, channel.clone());

        let body = r#"{"action":"frame","body":"simulated_base64_image_data_xyz_INVALID"}"#;
        handler.handle(&frame_event(Some(body.to_string()))).await;

        assert_eq!(
            channel.messages(),
            vec![json!({"frameSize": 0, "valid": false, "estimatedDistances": []})]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_still_acknowledged() {
        let channel = MockChannel {
            fail: true,
            ..MockChannel::default()
        };
        let handler = handler(MockInference::returning(person_detection()), channel.clone());

        let ack = handler.handle(&frame_event(Some(jpeg_body()))).await;

        assert_eq!(ack, Acknowledgment::ok("OK"));
        assert_eq!(channel.pushes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_calibration_loaded_on_first_event() {
        let handler = handler(
            MockInference::returning(InferenceResult::error("x")),
            MockChannel::default(),
        );
        assert!(!handler.calibration.is_loaded());

        handler.handle(&frame_event(Some("{}".to_string()))).await;

        assert!(handler.calibration.is_loaded());
    }

    #[test]
    fn test_event_deserialization() {
        let event: InboundEvent = serde_json::from_value(json!({
            "requestContext": {
                "connectionId": "abc=",
                "routeKey": "frame",
                "domainName": "xyz.execute-api.us-east-1.amazonaws.com",
                "stage": "prod"
            },
            "body": "{\"action\":\"frame\",\"body\":\"\"}"
        }))
        .unwrap();

        assert_eq!(event.request_context.connection_id, "abc=");
        assert_eq!(
            event.callback_address(),
            "https://xyz.execute-api.us-east-1.amazonaws.com/prod"
        );

        let event: InboundEvent =
            serde_json::from_value(json!({"requestContext": {"connectionId": "abc="}})).unwrap();
        assert_eq!(event.request_context.route_key, DEFAULT_ROUTE);
        assert!(event.body.is_none());
    }
}

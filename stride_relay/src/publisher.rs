use crate::{
    config::GatewayConfig, connections::ConnectionRegistry, distance::DetectedObject,
    telemetry::Metrics,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Connection is gone")]
    Gone,
    #[error("Push rejected with status {0}")]
    Rejected(StatusCode),
    #[error("Push transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PublishError {
    fn reason(&self) -> &'static str {
        match self {
            PublishError::Gone => "gone",
            PublishError::Rejected(_) => "rejected",
            PublishError::Transport(_) => "transport",
            PublishError::Serialize(_) => "serialize",
        }
    }
}

/// Delivers one text message to a client's duplex channel.
#[async_trait]
pub trait ChannelPush: Send + Sync + 'static {
    async fn push(
        &self,
        connection_id: &str,
        callback_address: &str,
        message: &str,
    ) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DistanceEntry {
    pub class_name: String,
    pub distance: String,
}

impl From<&DetectedObject> for DistanceEntry {
    fn from(object: &DetectedObject) -> Self {
        Self {
            class_name: object.bounding_box.class_name.clone(),
            distance: format!("{:.3}", object.distance_meters),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FramePayload {
    pub frame_size: usize,
    pub valid: bool,
    pub estimated_distances: Vec<DistanceEntry>,
}

impl FramePayload {
    pub fn new(frame_size: usize, valid: bool, objects: &[DetectedObject]) -> Self {
        Self {
            frame_size,
            valid,
            estimated_distances: objects.iter().map(DistanceEntry::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum OutboundMessage {
    Frame(FramePayload),
    Error(ErrorPayload),
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error(ErrorPayload {
            error: message.into(),
        })
    }
}

/// Pushes through the gateway's connection management API.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    client: reqwest::Client,
    management_endpoint: Option<String>,
}

impl GatewayClient {
    pub fn new(config: &GatewayConfig) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.push_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            management_endpoint: config.management_endpoint.clone(),
        })
    }

    fn connection_url(&self, callback_address: &str, connection_id: &str) -> String {
        let base = self
            .management_endpoint
            .as_deref()
            .unwrap_or(callback_address)
            .trim_end_matches('/');
        format!("{}/@connections/{}", base, connection_id)
    }
}

#[async_trait]
impl ChannelPush for GatewayClient {
    async fn push(
        &self,
        connection_id: &str,
        callback_address: &str,
        message: &str,
    ) -> Result<(), PublishError> {
        let url = self.connection_url(callback_address, connection_id);
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(message.to_string())
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::GONE => Err(PublishError::Gone),
            status => Err(PublishError::Rejected(status)),
        }
    }
}

/// Local connections are pushed in-process; anything else goes to the gateway.
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    registry: ConnectionRegistry,
    gateway: GatewayClient,
}

impl ChannelRouter {
    pub fn new(registry: ConnectionRegistry, gateway: GatewayClient) -> Self {
        Self { registry, gateway }
    }
}

#[async_trait]
impl ChannelPush for ChannelRouter {
    async fn push(
        &self,
        connection_id: &str,
        callback_address: &str,
        message: &str,
    ) -> Result<(), PublishError> {
        if self.registry.contains(connection_id) {
            self.registry
                .push(connection_id, callback_address, message)
                .await
        } else {
            self.gateway
                .push(connection_id, callback_address, message)
                .await
        }
    }
}

pub struct ResponsePublisher<P: ChannelPush> {
    channel: P,
    metrics: Arc<Metrics>,
}

impl<P: ChannelPush> ResponsePublisher<P> {
    pub fn new(channel: P, metrics: Arc<Metrics>) -> Self {
        Self { channel, metrics }
    }

    /// Best effort: failures are logged and counted, never returned.
    #[instrument(skip(self, payload))]
    pub async fn publish(
        &self,
        connection_id: &str,
        callback_address: &str,
        payload: &OutboundMessage,
    ) {
        if let Err(e) = self.try_publish(connection_id, callback_address, payload).await {
            tracing::warn!("Failed to push response to {}: {}", connection_id, e);
            self.metrics.record_publish_failure(e.reason());
        }
    }

    async fn try_publish(
        &self,
        connection_id: &str,
        callback_address: &str,
        payload: &OutboundMessage,
    ) -> Result<(), PublishError> {
        let message = serde_json::to_string(payload)?;
        tracing::debug!("Sending response: {}", message);
        self.channel
            .push(connection_id, callback_address, &message)
            .await?;
        tracing::debug!("Response sent to connection {}", connection_id);
        Ok(())
    }
}

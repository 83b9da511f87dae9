use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Deserialize;
use thiserror::Error;

const EMPTY_FRAME_MARKER: &str = "{}";
const JPEG_SIGNATURE: [u8; 2] = [0xFF, 0xD8];
const PNG_SIGNATURE: [u8; 4] = [0x89, 0x50, 0x4E, 0x47];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Identifies the image format from its leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(&JPEG_SIGNATURE) {
            Some(ImageFormat::Jpeg)
        } else if bytes.starts_with(&PNG_SIGNATURE) {
            Some(ImageFormat::Png)
        } else {
            None
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }
}

pub fn content_type_for(bytes: &[u8]) -> &'static str {
    ImageFormat::sniff(bytes)
        .map(|format| format.content_type())
        .unwrap_or("application/octet-stream")
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Empty frame")]
    EmptyFrame,
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize, Default)]
pub struct FrameEnvelope {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

impl FrameEnvelope {
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        if raw.trim() == EMPTY_FRAME_MARKER {
            return Err(EnvelopeError::EmptyFrame);
        }
        Ok(serde_json::from_str(raw)?)
    }
}

/// One inbound frame, decoded and sniffed. Never fails: problems show up as
/// empty `image_bytes` and a missing `format`.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    pub connection_id: String,
    pub callback_address: String,
    pub raw_base64: String,
    pub image_bytes: Vec<u8>,
    pub format: Option<ImageFormat>,
    pub empty_frame: bool,
}

impl FrameRequest {
    pub fn decode(connection_id: &str, callback_address: &str, envelope: Option<&str>) -> Self {
        let mut request = Self {
            connection_id: connection_id.to_string(),
            callback_address: callback_address.to_string(),
            raw_base64: String::new(),
            image_bytes: Vec::new(),
            format: None,
            empty_frame: false,
        };

        let envelope = match FrameEnvelope::parse(envelope.unwrap_or(EMPTY_FRAME_MARKER)) {
            Ok(envelope) => envelope,
            Err(EnvelopeError::EmptyFrame) => {
                request.empty_frame = true;
                return request;
            }
            Err(e) => {
                tracing::warn!(connection_id, "Rejecting frame envelope: {}", e);
                return request;
            }
        };

        request.raw_base64 = envelope.body.unwrap_or_default();
        if request.raw_base64.is_empty() {
            tracing::debug!(connection_id, "Frame envelope carries no image payload");
            return request;
        }

        match STANDARD.decode(strip_data_url(&request.raw_base64)) {
            Ok(bytes) => request.image_bytes = bytes,
            Err(e) => {
                tracing::warn!(connection_id, "Payload is not valid base64: {}", e);
                return request;
            }
        }

        request.format = ImageFormat::sniff(&request.image_bytes);
        match request.format {
            Some(format) => tracing::debug!(
                connection_id,
                "Valid {} frame, {} bytes",
                format.content_type(),
                request.image_bytes.len()
            ),
            None => tracing::info!(
                connection_id,
                "Decoded {} bytes but header is neither JPEG nor PNG",
                request.image_bytes.len()
            ),
        }

        request
    }

    pub fn is_valid_image(&self) -> bool {
        self.format.is_some()
    }

    pub fn frame_size(&self) -> usize {
        self.image_bytes.len()
    }
}

fn strip_data_url(payload: &str) -> &str {
    let payload = payload.trim();
    if payload.starts_with("data:") {
        if let Some((_, data)) = payload.split_once(";base64,") {
            return data;
        }
    }
    payload
}

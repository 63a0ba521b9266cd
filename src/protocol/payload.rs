//! Typed payloads carried inside protocol messages
//!
//! Control and text messages carry a JSON object; audio carries raw sample
//! bytes with the `BINARY` flag set.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{AudioCodec, Message, MessageFlags, MessageKind};
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub device_id: String,
    pub device_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    pub ping_timestamp: u32,
    pub timestamp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConfigPayload {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
    pub codec: AudioCodec,
}

/// Free-form command from the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

fn json_message<T: Serialize>(
    kind: MessageKind,
    body: &T,
    timestamp: u32,
) -> Result<Message, ProtocolError> {
    let payload =
        serde_json::to_vec(body).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
    Ok(Message::new(kind, payload, timestamp))
}

impl Message {
    pub fn auth(
        device_id: &str,
        device_name: &str,
        version: &str,
        api_key: Option<&str>,
        timestamp: u32,
    ) -> Result<Self, ProtocolError> {
        let body = AuthPayload {
            device_id: device_id.to_string(),
            device_name: device_name.to_string(),
            version: version.to_string(),
            api_key: api_key.map(str::to_string),
        };
        json_message(MessageKind::Auth, &body, timestamp)
    }

    pub fn auth_response(
        success: bool,
        error: Option<&str>,
        timestamp: u32,
    ) -> Result<Self, ProtocolError> {
        let body = AuthResponsePayload {
            success,
            error: error.map(str::to_string),
        };
        json_message(MessageKind::AuthResponse, &body, timestamp)
    }

    pub fn text(text: &str, device_id: &str, timestamp: u32) -> Result<Self, ProtocolError> {
        let body = TextPayload {
            text: text.to_string(),
            device_id: device_id.to_string(),
        };
        json_message(MessageKind::Text, &body, timestamp)
    }

    /// Binary audio chunk. `FINAL` marks the end of an utterance; an empty
    /// final chunk is a pure end marker.
    pub fn audio(data: impl Into<Bytes>, is_final: bool, codec: AudioCodec, timestamp: u32) -> Self {
        let mut flags = MessageFlags::BINARY;
        if is_final {
            flags |= MessageFlags::FINAL;
        }
        if codec == AudioCodec::Opus {
            flags |= MessageFlags::COMPRESSED;
        }
        Message::new(MessageKind::Audio, data, timestamp).with_flags(flags)
    }

    pub fn response(text: &str, is_final: bool, timestamp: u32) -> Result<Self, ProtocolError> {
        let kind = if is_final {
            MessageKind::ResponseFinal
        } else {
            MessageKind::Response
        };
        let body = ResponsePayload {
            text: text.to_string(),
            is_final,
        };
        let msg = json_message(kind, &body, timestamp)?;
        Ok(if is_final {
            msg.with_flags(MessageFlags::FINAL)
        } else {
            msg
        })
    }

    pub fn status(status: &str, timestamp: u32) -> Result<Self, ProtocolError> {
        let body = StatusPayload {
            status: status.to_string(),
        };
        json_message(MessageKind::Status, &body, timestamp)
    }

    pub fn error(error: &str, code: Option<i32>, timestamp: u32) -> Result<Self, ProtocolError> {
        let body = ErrorPayload {
            error: error.to_string(),
            code,
        };
        json_message(MessageKind::Error, &body, timestamp)
    }

    pub fn ping(timestamp: u32) -> Result<Self, ProtocolError> {
        json_message(MessageKind::Ping, &PingPayload { timestamp }, timestamp)
    }

    pub fn pong(ping_timestamp: u32, timestamp: u32) -> Result<Self, ProtocolError> {
        let body = PongPayload {
            ping_timestamp,
            timestamp,
        };
        json_message(MessageKind::Pong, &body, timestamp)
    }

    pub fn audio_config(
        sample_rate: u32,
        channels: u8,
        bits_per_sample: u8,
        codec: AudioCodec,
        timestamp: u32,
    ) -> Result<Self, ProtocolError> {
        let body = AudioConfigPayload {
            sample_rate,
            channels,
            bits_per_sample,
            codec,
        };
        json_message(MessageKind::AudioConfig, &body, timestamp)
    }

    /// Parse a JSON payload into `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.flags.is_binary() {
            return Err(ProtocolError::InvalidPayload(format!(
                "{} payload is binary",
                self.kind
            )));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::InvalidPayload(format!("{}: {}", self.kind, e)))
    }
}

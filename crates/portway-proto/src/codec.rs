//! Codec for channel frames
//!
//! Every frame on the wire is a JSON object
//! `{"type": .., "message": .., "data": {..}, "timestamp": <epoch millis>}`.
//! The `type` field selects how `data` is decoded.

use crate::messages::{ControlMessage, HeartbeatPayload, MessageType};
use crate::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid payload for {ty}: {reason}")]
    InvalidPayload { ty: MessageType, reason: String },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// A decoded channel frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub message: String,
    pub timestamp: i64,
    pub body: ControlMessage,
}

impl Frame {
    pub fn new(body: ControlMessage) -> Self {
        Self::with_message(body, "")
    }

    pub fn with_message(body: ControlMessage, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            body,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::with_message(ControlMessage::Info, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_message(ControlMessage::Error, message)
    }

    /// Heartbeat sent back to a node
    pub fn heartbeat_ack() -> Self {
        Self::with_message(
            ControlMessage::Heartbeat(HeartbeatPayload::default()),
            "pong",
        )
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}

#[derive(Serialize, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    ty: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    timestamp: i64,
}

/// JSON text codec for [`Frame`]s
pub struct FrameCodec;

impl FrameCodec {
    /// Encode a frame to its JSON text form
    pub fn encode(frame: &Frame) -> Result<String, CodecError> {
        let data = match &frame.body {
            ControlMessage::Register(p) => serde_json::to_value(p)?,
            ControlMessage::Heartbeat(p) => serde_json::to_value(p)?,
            ControlMessage::StatusUpdate(p) => serde_json::to_value(p)?,
            ControlMessage::HardwareStatus(p) => serde_json::to_value(p)?,
            ControlMessage::DataResponse(p) => serde_json::to_value(p)?,
            ControlMessage::ConnectionResponse(p) => serde_json::to_value(p)?,
            ControlMessage::TunnelStart(p) => serde_json::to_value(p)?,
            ControlMessage::TunnelStop(p) => serde_json::to_value(p)?,
            ControlMessage::HardwareStatusAck | ControlMessage::Error | ControlMessage::Info => {
                Value::Object(Default::default())
            }
        };

        let raw = RawFrame {
            ty: frame.message_type().as_str().to_string(),
            message: frame.message.clone(),
            data,
            timestamp: frame.timestamp,
        };

        let text = serde_json::to_string(&raw)?;
        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }
        Ok(text)
    }

    /// Decode a frame from JSON text
    pub fn decode(text: &str) -> Result<Frame, CodecError> {
        if text.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(text.len()));
        }

        let raw: RawFrame = serde_json::from_str(text)?;
        let ty: MessageType = raw.ty.parse().map_err(CodecError::UnknownType)?;

        let data = match raw.data {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };

        let body = match ty {
            MessageType::Register => ControlMessage::Register(payload(ty, data)?),
            MessageType::Heartbeat => ControlMessage::Heartbeat(payload(ty, data)?),
            MessageType::StatusUpdate => ControlMessage::StatusUpdate(payload(ty, data)?),
            MessageType::HardwareStatus => ControlMessage::HardwareStatus(payload(ty, data)?),
            MessageType::DataResponse => ControlMessage::DataResponse(payload(ty, data)?),
            MessageType::ConnectionResponse => {
                ControlMessage::ConnectionResponse(payload(ty, data)?)
            }
            MessageType::TunnelStart => ControlMessage::TunnelStart(payload(ty, data)?),
            MessageType::TunnelStop => ControlMessage::TunnelStop(payload(ty, data)?),
            MessageType::HardwareStatusAck => ControlMessage::HardwareStatusAck,
            MessageType::Error => ControlMessage::Error,
            MessageType::Info => ControlMessage::Info,
        };

        Ok(Frame {
            message: raw.message,
            timestamp: raw.timestamp,
            body,
        })
    }
}

fn payload<T: serde::de::DeserializeOwned>(ty: MessageType, data: Value) -> Result<T, CodecError> {
    serde_json::from_value(data).map_err(|e| CodecError::InvalidPayload {
        ty,
        reason: e.to_string(),
    })
}

use crate::{ChatMessage, FileTree, ProjectId};
use chrono::Utc;
use serde::de::{self, DeserializeOwned, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const CURRENT: Self = Self(CURRENT_PROTOCOL_VERSION);
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl Serialize for ProtocolVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for ProtocolVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ProtocolVersionVisitor;

        impl<'de> Visitor<'de> for ProtocolVersionVisitor {
            type Value = ProtocolVersion;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a protocol version as string or integer")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let version = u16::try_from(value)
                    .map_err(|_| E::custom(format!("protocol version out of range: {value}")))?;
                Ok(ProtocolVersion(version))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "protocol version cannot be negative: {value}"
                    )));
                }
                self.visit_u64(value as u64)
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                let cleaned = value.trim().trim_start_matches('v');
                let version = cleaned.parse::<u16>().map_err(|err| {
                    E::custom(format!("invalid protocol version '{value}': {err}"))
                })?;
                Ok(ProtocolVersion(version))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                self.visit_str(&value)
            }
        }

        deserializer.deserialize_any(ProtocolVersionVisitor)
    }
}

/// One frame on the real-time channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelEnvelope {
    #[serde(default)]
    pub version: ProtocolVersion,
    pub project_id: ProjectId,
    pub sender_id: String,
    pub timestamp: String,
    #[serde(flatten)]
    pub event: ChannelEvent,
}

impl ChannelEnvelope {
    pub fn new(project_id: ProjectId, sender_id: impl Into<String>, event: ChannelEvent) -> Self {
        Self {
            version: ProtocolVersion::CURRENT,
            project_id,
            sender_id: sender_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            event,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.project_id.is_empty() || self.sender_id.is_empty() || self.timestamp.is_empty() {
            return Err("missing_required_fields");
        }
        if self.version != ProtocolVersion::CURRENT {
            return Err("unsupported_version");
        }
        if chrono::DateTime::parse_from_rfc3339(&self.timestamp).is_err() {
            return Err("invalid_timestamp");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum ChannelEvent {
    Hello(HelloPayload),
    ProjectMessage(ChatMessage),
    ProjectCode(FileTree),
    Error(ErrorPayload),
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Hello(_) => EventKind::Hello,
            ChannelEvent::ProjectMessage(_) => EventKind::ProjectMessage,
            ChannelEvent::ProjectCode(_) => EventKind::ProjectCode,
            ChannelEvent::Error(_) => EventKind::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Hello,
    ProjectMessage,
    ProjectCode,
    Error,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Hello => "hello",
            EventKind::ProjectMessage => "project-message",
            EventKind::ProjectCode => "project-code",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub client_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(raw: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

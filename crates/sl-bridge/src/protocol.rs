use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sl_core::Envelope;

/// One message on the persistent node/observer ↔ hub channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum Frame {
    // Node -> Hub
    PublishEvent(Envelope),
    AcknowledgeCommand(CommandAck),

    // Hub -> Node / Observer
    ReceiveEnvelope(Envelope),

    // Observer -> Hub
    WatchNodes(WatchNodes),

    // Hub -> any client
    Ping(Heartbeat),
}

impl Frame {
    pub fn ping() -> Self {
        Frame::Ping(Heartbeat {
            timestamp: Utc::now(),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::PublishEvent(_) => "publishEvent",
            Frame::AcknowledgeCommand(_) => "acknowledgeCommand",
            Frame::ReceiveEnvelope(_) => "receiveEnvelope",
            Frame::WatchNodes(_) => "watchNodes",
            Frame::Ping(_) => "ping",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A node's report on a command it processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandAck {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CommandAck {
    pub fn completed(command_id: Uuid, response_payload: Option<String>) -> Self {
        Self {
            command_id,
            success: true,
            response_payload,
            error_message: None,
        }
    }

    pub fn failed(command_id: Uuid, error_message: impl Into<String>) -> Self {
        Self {
            command_id,
            success: false,
            response_payload: None,
            error_message: Some(error_message.into()),
        }
    }
}

/// Narrows an observer's event feed to the listed nodes (plus broadcasts).
/// An empty list restores the unfiltered feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchNodes {
    pub node_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use crate::messages::{Command, Event, Message};
use crate::registry::MessageRegistry;

/// Target id meaning "every connected node / observer".
pub const BROADCAST: Uuid = Uuid::nil();

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("malformed {message_type} payload: {source}")]
    MalformedPayload {
        message_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// MessageKind / Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Command,
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "command"),
            MessageKind::Event => write!(f, "event"),
        }
    }
}

/// Typed envelope body; the variant is the kind discriminant.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Command(Command),
    Event(Event),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Command(_) => MessageKind::Command,
            Payload::Event(_) => MessageKind::Event,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Command(c) => c.type_name(),
            Payload::Event(e) => e.type_name(),
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Payload::Command(c) => c.to_value(),
            Payload::Event(e) => e.to_value(),
        }
    }
}

impl From<Command> for Payload {
    fn from(c: Command) -> Self {
        Payload::Command(c)
    }
}

impl From<Event> for Payload {
    fn from(e: Event) -> Self {
        Payload::Event(e)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The uniform message wrapper exchanged between node, hub and observers.
///
/// Identity (`id`) and `timestamp` are stamped at construction and never
/// change. Two envelopes with the same `id` are the same logical message no
/// matter how often they are received.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: Uuid,
    origin_node_id: Uuid,
    target_node_id: Uuid,
    timestamp: DateTime<Utc>,
    trace_parent: Option<String>,
    payload: Payload,
}

impl Envelope {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(origin_node_id: Uuid, target_node_id: Uuid, payload: impl Into<Payload>) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin_node_id,
            target_node_id,
            timestamp: Utc::now(),
            trace_parent: None,
            payload: payload.into(),
        }
    }

    /// Allocate an empty `M`, let `fill` populate it, then stamp identity.
    ///
    /// ```ignore
    /// let env = Envelope::build::<KickPlayer>(HUB, node, |k| k.player_id = "p-1".into());
    /// ```
    pub fn build<M: Message>(
        origin_node_id: Uuid,
        target_node_id: Uuid,
        fill: impl FnOnce(&mut M),
    ) -> Self {
        let mut message = M::default();
        fill(&mut message);
        Self::new(origin_node_id, target_node_id, message.into_payload())
    }

    /// Attach a W3C `traceparent` string.
    pub fn with_trace_parent(mut self, trace_parent: impl Into<String>) -> Self {
        self.trace_parent = Some(trace_parent.into());
        self
    }

    /// A copy addressed to `target_node_id` under a new identity.
    ///
    /// Used when one logical broadcast command is queued separately per node.
    pub fn fork_for(&self, target_node_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_node_id,
            ..self.clone()
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn message_type(&self) -> &'static str {
        self.payload.type_name()
    }

    pub fn origin_node_id(&self) -> Uuid {
        self.origin_node_id
    }

    pub fn target_node_id(&self) -> Uuid {
        self.target_node_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn trace_parent(&self) -> Option<&str> {
        self.trace_parent.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn is_command(&self) -> bool {
        self.kind() == MessageKind::Command
    }

    pub fn is_event(&self) -> bool {
        self.kind() == MessageKind::Event
    }

    pub fn command(&self) -> Option<&Command> {
        match &self.payload {
            Payload::Command(c) => Some(c),
            Payload::Event(_) => None,
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match &self.payload {
            Payload::Event(e) => Some(e),
            Payload::Command(_) => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_node_id == BROADCAST
    }

    /// Routing rule: addressed to `node_id` directly or to everyone.
    pub fn is_addressed_to(&self, node_id: Uuid) -> bool {
        self.is_broadcast() || self.target_node_id == node_id
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        let wire: WireEnvelope = serde_json::from_str(json)?;
        Self::try_from(wire)
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// JSON shape of an envelope on the wire; `data` is resolved through the
/// [`MessageRegistry`] using `message_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub id: Uuid,
    pub message_type: String,
    pub origin_server_id: Uuid,
    pub target_server_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub trace_parent: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let payload = MessageRegistry::global().decode(&wire.message_type, wire.data)?;
        Ok(Self {
            id: wire.id,
            origin_node_id: wire.origin_server_id,
            target_node_id: wire.target_server_id,
            timestamp: wire.timestamp,
            trace_parent: wire.trace_parent,
            payload,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self.payload.to_value().map_err(serde::ser::Error::custom)?;
        WireEnvelope {
            id: self.id,
            message_type: self.message_type().to_string(),
            origin_server_id: self.origin_node_id,
            target_server_id: self.target_node_id,
            timestamp: self.timestamp,
            trace_parent: self.trace_parent.clone(),
            data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireEnvelope::deserialize(deserializer)?;
        Envelope::try_from(wire).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{KickPlayer, ServerHeartbeat};

    #[test]
    fn new_stamps_distinct_ids() {
        let a = Envelope::new(Uuid::new_v4(), BROADCAST, ServerHeartbeat::default());
        let b = Envelope::new(Uuid::new_v4(), BROADCAST, ServerHeartbeat::default());
        assert_ne!(a.id(), b.id());
        assert!(a.is_event());
        assert!(a.is_broadcast());
    }

    #[test]
    fn build_populates_before_stamping() {
        let node = Uuid::new_v4();
        let env = Envelope::build::<KickPlayer>(BROADCAST, node, |k| {
            k.player_id = "steam:42".into();
            k.reason = Some("afk".into());
        });
        assert_eq!(env.message_type(), "KickPlayer");
        assert_eq!(env.kind(), MessageKind::Command);
        assert!(env.is_addressed_to(node));
        assert!(!env.is_addressed_to(Uuid::new_v4()));
        match env.command() {
            Some(Command::KickPlayer(k)) => assert_eq!(k.player_id, "steam:42"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn broadcast_is_addressed_to_everyone() {
        let env = Envelope::new(Uuid::new_v4(), BROADCAST, ServerHeartbeat::default());
        assert!(env.is_addressed_to(Uuid::new_v4()));
    }

    #[test]
    fn fork_keeps_payload_and_changes_identity() {
        let env = Envelope::build::<KickPlayer>(Uuid::new_v4(), BROADCAST, |k| {
            k.player_id = "p".into()
        })
        .with_trace_parent("00-abc-def-01");
        let node = Uuid::new_v4();
        let fork = env.fork_for(node);
        assert_ne!(fork.id(), env.id());
        assert_eq!(fork.target_node_id(), node);
        assert_eq!(fork.payload(), env.payload());
        assert_eq!(fork.trace_parent(), Some("00-abc-def-01"));
    }

    #[test]
    fn wire_field_names() {
        let env = Envelope::new(Uuid::new_v4(), BROADCAST, ServerHeartbeat {
            players_online: 3,
            tick_rate: 20.0,
            uptime_secs: 60,
        });
        let v: Value = serde_json::to_value(&env).unwrap();
        assert_eq!(v["messageType"], "ServerHeartbeat");
        assert_eq!(v["targetServerId"], BROADCAST.to_string());
        assert_eq!(v["data"]["playersOnline"], 3);
        assert!(v["traceParent"].is_null());
        assert!(v.get("originServerId").is_some());
    }
}

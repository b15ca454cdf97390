//! Explicit message registry: wire type tag → typed decoder.
//!
//! The table is filled once at startup from the closed message catalogue in
//! [`crate::messages`]; no runtime type scanning is involved.

use std::sync::LazyLock;

use ahash::AHashMap;
use serde_json::Value;

use crate::envelope::{EnvelopeError, MessageKind, Payload};
use crate::messages::{self, Message};

/// Registry entry for one concrete message type.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    pub type_name: &'static str,
    pub kind: MessageKind,
    decode: fn(Value) -> Result<Payload, serde_json::Error>,
    default: fn() -> Payload,
}

impl MessageSpec {
    /// Decode the `data` section of a wire envelope into a typed payload.
    pub fn decode(&self, data: Value) -> Result<Payload, EnvelopeError> {
        (self.decode)(data).map_err(|source| EnvelopeError::MalformedPayload {
            message_type: self.type_name.to_string(),
            source,
        })
    }

    /// A freshly allocated, empty payload of this type.
    pub fn default_payload(&self) -> Payload {
        (self.default)()
    }
}

fn decode_as<M: Message>(data: Value) -> Result<Payload, serde_json::Error> {
    serde_json::from_value::<M>(data).map(Message::into_payload)
}

fn default_of<M: Message>() -> Payload {
    M::default().into_payload()
}

/// Lookup table from `messageType` to [`MessageSpec`].
#[derive(Debug, Default)]
pub struct MessageRegistry {
    specs: AHashMap<&'static str, MessageSpec>,
}

static BUILTIN: LazyLock<MessageRegistry> = LazyLock::new(MessageRegistry::builtin);

impl MessageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every message in the builtin catalogue.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        messages::register_builtin(&mut registry);
        registry
    }

    /// The process-wide builtin registry used by envelope decoding.
    pub fn global() -> &'static MessageRegistry {
        &BUILTIN
    }

    pub fn register<M: Message>(&mut self) -> &mut Self {
        self.specs.insert(
            M::TYPE_NAME,
            MessageSpec {
                type_name: M::TYPE_NAME,
                kind: M::KIND,
                decode: decode_as::<M>,
                default: default_of::<M>,
            },
        );
        self
    }

    pub fn lookup(&self, type_name: &str) -> Option<&MessageSpec> {
        self.specs.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.specs.contains_key(type_name)
    }

    /// Decode `data` as the message registered under `type_name`.
    pub fn decode(&self, type_name: &str, data: Value) -> Result<Payload, EnvelopeError> {
        self.lookup(type_name)
            .ok_or_else(|| EnvelopeError::UnknownMessageType(type_name.to_string()))?
            .decode(data)
    }

    /// All registered type names of the given kind, sorted.
    pub fn type_names(&self, kind: MessageKind) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .specs
            .values()
            .filter(|s| s.kind == kind)
            .map(|s| s.type_name)
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

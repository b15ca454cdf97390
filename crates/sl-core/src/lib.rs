//! Core data contracts for serverlink.
//!
//! Everything both sides of the bridge agree on lives here:
//! - [`envelope`]: the uniform Command/Event wrapper and its wire encoding
//! - [`messages`]: the closed catalogue of concrete command and event types
//! - [`registry`]: type-tag → decoder lookup, built once at startup
//! - [`outbox`]: the hub's durable per-node command queue (SQLite)
//! - [`config`]: TOML configuration shared by the hub and node binaries

pub mod config;
pub mod envelope;
pub mod messages;
pub mod outbox;
pub mod registry;

pub use envelope::{Envelope, EnvelopeError, MessageKind, Payload, BROADCAST};
pub use messages::{Command, Event, Message};

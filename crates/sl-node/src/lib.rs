//! Node side of serverlink: the agent a game server embeds to exchange
//! commands and events with the hub.
//!
//! - [`agent`]: connection, dedup, dispatch and ack plumbing
//! - [`handlers`]: typed per-command handler registry

pub mod agent;
pub mod handlers;

pub use agent::{NodeAgent, NodeError, NodeOptions};
pub use handlers::{HandlerError, HandlerRegistry, HandlerResult};

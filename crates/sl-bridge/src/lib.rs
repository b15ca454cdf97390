//! Message bridge between game-server nodes, the hub and dashboard observers.
//!
//! Key modules:
//! - [`local_bus`]: in-process broadcast of envelopes, with optional worker pool
//! - [`dedup`]: node-side guard against dispatching a command twice
//! - [`transport`]: transport abstraction and the reconnecting [`transport::ManagedConnection`]
//! - [`ws_client`]: websocket connector used by nodes and observers
//! - [`hub`]: hub-side routing, claim validation, outbox drain and acks
//! - [`ws`]: axum router exposing the hub's realtime endpoints
//! - [`auth`]: signed bearer token validation

pub mod auth;
pub mod connections;
pub mod dedup;
pub mod error;
pub mod hub;
pub mod local_bus;
pub mod protocol;
pub mod transport;
pub mod ws;
pub mod ws_client;

pub use error::BridgeError;
pub use local_bus::{BusEvent, LocalBus, Subscription};
pub use protocol::{CommandAck, Frame};

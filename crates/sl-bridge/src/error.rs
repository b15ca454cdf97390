use uuid::Uuid;

use sl_core::outbox::OutboxError;

use crate::auth::AuthError;
use crate::transport::TransportError;

/// Hub-side routing and validation failures.
///
/// Validation variants describe a single rejected frame; the session that
/// received it logs the error and keeps the connection open.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("outbox: {0}")]
    Outbox(#[from] OutboxError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("envelope {0} is not a command")]
    NotACommand(Uuid),

    #[error("envelope {0} is not an event")]
    NotAnEvent(Uuid),

    #[error("origin {origin} does not match connection claim {claimed}")]
    OriginMismatch { claimed: Uuid, origin: Uuid },

    #[error("node {node_id} acknowledged command {command_id} addressed to another node")]
    ForeignAck { node_id: Uuid, command_id: Uuid },

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}

impl BridgeError {
    /// True for per-frame validation failures that leave the connection usable.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BridgeError::NotACommand(_)
                | BridgeError::NotAnEvent(_)
                | BridgeError::OriginMismatch { .. }
                | BridgeError::ForeignAck { .. }
                | BridgeError::UnexpectedFrame(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

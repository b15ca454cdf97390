//! Typed command handlers.
//!
//! Handlers are registered per concrete command type and receive the
//! already-decoded message. Several handlers may share one type; each runs
//! inside its own `catch_unwind` so one failing handler never stops the rest.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use ahash::AHashMap;
use sl_bridge::local_bus::panic_message;
use sl_bridge::protocol::CommandAck;
use sl_core::{Envelope, Message};
use sl_telemetry::metrics::{global_metrics, names};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid command: {0}")]
    Invalid(String),
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// `Ok(Some(_))` becomes the ack's `responsePayload`.
pub type HandlerResult = Result<Option<String>, HandlerError>;

type ErasedHandler = Arc<dyn Fn(&Envelope) -> HandlerResult + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: AHashMap<&'static str, Vec<ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for command type `M`.
    pub fn on<M, F>(&mut self, handler: F) -> &mut Self
    where
        M: Message,
        F: Fn(&M, &Envelope) -> HandlerResult + Send + Sync + 'static,
    {
        let erased: ErasedHandler = Arc::new(move |env: &Envelope| match M::from_payload(env.payload()) {
            Some(message) => handler(message, env),
            None => Err(HandlerError::Invalid(format!(
                "expected {}, got {}",
                M::TYPE_NAME,
                env.message_type()
            ))),
        });
        self.handlers.entry(M::TYPE_NAME).or_default().push(erased);
        self
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Number of command types with at least one handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler registered for the command and fold the results into
    /// one ack: completed when all succeed, failed otherwise.
    pub fn dispatch(&self, command: &Envelope) -> CommandAck {
        let message_type = command.message_type();
        let Some(handlers) = self.handlers.get(message_type) else {
            tracing::warn!(command_id = %command.id(), message_type, "no handler registered");
            return CommandAck::failed(command.id(), format!("no handler registered for {message_type}"));
        };

        let mut responses = Vec::new();
        let mut failures = Vec::new();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(command))) {
                Ok(Ok(Some(response))) => responses.push(response),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    global_metrics().increment_counter(names::HANDLER_FAILURES_TOTAL, &[("stage", "handler")]);
                    tracing::warn!(command_id = %command.id(), message_type, error = %e, "command handler failed");
                    failures.push(e.to_string());
                }
                Err(panic) => {
                    let e = HandlerError::Panicked(panic_message(&*panic));
                    global_metrics().increment_counter(names::HANDLER_FAILURES_TOTAL, &[("stage", "handler")]);
                    tracing::error!(command_id = %command.id(), message_type, error = %e, "command handler panicked");
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            let response = (!responses.is_empty()).then(|| responses.join("\n"));
            CommandAck::completed(command.id(), response)
        } else {
            CommandAck::failed(command.id(), failures.join("; "))
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

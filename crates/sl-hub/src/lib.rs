//! serverlink hub process: serves the node and observer websocket endpoints
//! around one [`sl_bridge::hub::Hub`], sweeps the outbox and shuts down
//! gracefully.

pub mod daemon;
pub mod shutdown;

pub use daemon::HubDaemon;
pub use shutdown::{DrainGuard, DrainResult, ShutdownSignal};

//! Observability for serverlink processes.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus export
//! - **Tracing**: W3C `traceparent` generation/parsing for envelope
//!   correlation, plus request-id middleware for the hub router

pub mod logging;
pub mod metrics;
pub mod tracing_setup;

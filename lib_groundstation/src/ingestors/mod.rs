//! # Data Ingestors Module
//!
//! Clients that bring telemetry into the ground station. Each submodule owns
//! the protocol details of one source and hands normalised samples to the
//! core's latest-value cache.
//!
//! ## Contained Modules:
//! - **`telemetry_wss`**: The resilient WebSocket ingestion adapter. One
//!   connection, reconnect with backoff, malformed frames discarded.
//! - **`har`**: Codec for the `$$HAR` tracker sentences read off the radio
//!   link and forwarded as wire messages.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// The WebSocket ingestion adapter feeding the latest-value cache.
pub mod telemetry_wss;
/// Decoder for balloon tracker sentences.
pub mod har;

// --- Public API Re-exports ---
pub use har::{HarError, HarSentence};
pub use telemetry_wss::{
    ConnectionError, ConnectionState, IngestConfig, IngestError, IngestStats, IngestionAdapter,
    IngestionTasks,
};

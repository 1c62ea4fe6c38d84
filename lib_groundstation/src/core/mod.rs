//! # Core Engine Module
//!
//! The composition and delivery engine of the ground station. Everything a
//! display or relay needs to look up objects and receive live telemetry lives
//! here; transports (WebSocket ingestion, HTTP relays) sit on top of it.
//!
//! ## Core Components:
//!
//! - **`types`**: Identifiers, object descriptors, telemetry metadata and the
//!   timestamped samples that flow through the system.
//!
//! - **`registry`**: The module registry. Modules are declared once, in a fixed
//!   order, and can be toggled on and off at runtime.
//!
//! - **`composer`**: Flattens the extensions of enabled modules into ordered,
//!   per-category lists that the provider chains consult.
//!
//! - **`objects`**: The object provider chain. First match wins, the root
//!   sentinel is served without any provider.
//!
//! - **`telemetry`**: The telemetry provider chain. Exactly one provider owns
//!   live delivery for an object.
//!
//! - **`multiplexer`**: The latest-value cache and the periodic distributor
//!   that coalesces bursts into one delivery per tick.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Plain data types shared by every component.
pub mod types;
/// Ordered module declarations with runtime enable flags.
pub mod registry;
/// Per-category composition of enabled modules' extensions.
pub mod composer;
/// Ordered, short-circuiting object resolution.
pub mod objects;
/// Single-owner live telemetry subscriptions.
pub mod telemetry;
/// Latest-value cache and fixed-cadence fan-out.
pub mod multiplexer;

// --- Public API Re-exports ---
pub use composer::{Contribution, ExtensionComposer};
pub use multiplexer::{
    DeliveryMode, HandleId, LatestValueCache, LiveTelemetryProvider, SubscriptionMultiplexer,
    DEFAULT_DISTRIBUTION_PERIOD, DEFAULT_UNSERVED_LIMIT,
};
pub use objects::{ObjectProvider, ObjectProviderChain, ROOT_TYPE};
pub use registry::{Extension, ExtensionCategory, ModuleDescriptor, ModuleRegistry, RegistryError};
pub use telemetry::{Subscription, TelemetryCallback, TelemetryError, TelemetryProvider, TelemetryProviderChain};
pub use types::{
    Identifier, Location, MetadataError, ObjectDescriptor, ObjectType, Scalar, TelemetryDatum,
    TelemetryMetadata, ValueHints, ValueMetadata,
};

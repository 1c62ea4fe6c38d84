//! # lib_groundstation
//!
//! Module composition and live telemetry distribution for the ground-station
//! tools. `core` is always built; transports and process plumbing sit behind
//! cargo features so a consumer only pulls the stack it uses.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod core;

#[cfg(feature = "configs")]
pub mod configs;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "plugins")]
pub mod plugins;

pub use crate::core::{
    ExtensionComposer, Identifier, ModuleDescriptor, ModuleRegistry, ObjectDescriptor,
    ObjectProviderChain, Subscription, TelemetryDatum, TelemetryProviderChain,
};

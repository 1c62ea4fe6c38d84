//! # Configuration Modules
//!
//! Static configuration read once at startup.

/// The ordered module manifest (JSON5).
pub mod manifest;

pub use manifest::{ManifestEntry, ManifestError, ModuleManifest};

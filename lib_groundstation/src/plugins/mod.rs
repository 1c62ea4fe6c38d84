//! # Plugin Modules
//!
//! Module descriptors shipped with the ground station. A process builds the
//! catalog once and hands it to the manifest, which decides order and
//! enabled flags.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

use std::sync::Arc;

use crate::core::multiplexer::SubscriptionMultiplexer;
use crate::core::registry::ModuleDescriptor;
use crate::core::types::{MetadataError, ObjectType};

/// The HABET balloon telemetry plugin.
pub mod habet;

pub const CORE_MODULE_ID: &str = "platform/core";
pub const FOLDER_TYPE: &str = "folder";

/// Base types every display relies on.
pub fn core_module() -> ModuleDescriptor {
    ModuleDescriptor::builder(CORE_MODULE_ID)
        .object_type(ObjectType {
            creatable: true,
            ..ObjectType::new(FOLDER_TYPE, "Folder", "A container for other objects")
        })
        .build()
}

/// Every module this build knows about, in default priority order.
pub fn catalog(multiplexer: Arc<SubscriptionMultiplexer>) -> Result<Vec<ModuleDescriptor>, MetadataError> {
    Ok(vec![core_module(), habet::module(multiplexer)?])
}

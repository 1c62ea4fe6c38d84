//! # HABET Balloon Telemetry Plugin
//!
//! Contributes the `example.telemetry` namespace: a root folder, the single
//! live telemetry point fed by the tracker relay, and the telemetry provider
//! that serves that point from a [`SubscriptionMultiplexer`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::multiplexer::{LiveTelemetryProvider, SubscriptionMultiplexer};
use crate::core::objects::ObjectProvider;
use crate::core::registry::ModuleDescriptor;
use crate::core::types::{
    Identifier, Location, MetadataError, ObjectDescriptor, ObjectType, TelemetryMetadata,
    ValueMetadata, TIMESTAMP_KEY,
};
use crate::plugins::FOLDER_TYPE;

pub const MODULE_ID: &str = "example/habet";
pub const NAMESPACE: &str = "example.telemetry";
pub const ROOT_KEY: &str = "root";
pub const POINT_KEY: &str = "websocket.telemetry";
/// Type key of the live point.
pub const POINT_TYPE: &str = "example.telemetry";

pub fn root_identifier() -> Identifier {
    Identifier::new(NAMESPACE, ROOT_KEY)
}

pub fn point_identifier() -> Identifier {
    Identifier::new(NAMESPACE, POINT_KEY)
}

/// Values reported by the tracker, time axis first.
pub fn point_metadata() -> Result<TelemetryMetadata, MetadataError> {
    TelemetryMetadata::new(vec![
        ValueMetadata::domain(TIMESTAMP_KEY, "Timestamp", "utc", 1),
        ValueMetadata::range("latitude", "Latitude", "float", 1),
        ValueMetadata::range("longitude", "Longitude", "float", 2),
        ValueMetadata::range("altitude", "Altitude", "float", 3),
        ValueMetadata::range("temperature", "Temperature", "float", 4),
        ValueMetadata::range("pressure", "Pressure", "float", 5),
        ValueMetadata::range("humidity", "Humidity", "float", 6),
    ])
}

/// Resolves the live telemetry point.
pub struct PointProvider {
    descriptor: ObjectDescriptor,
}

impl PointProvider {
    pub fn new() -> Result<Self, MetadataError> {
        let descriptor = ObjectDescriptor::new(point_identifier(), "WebSocket Telemetry", POINT_TYPE)
            .with_location(Location::Object(root_identifier()))
            .with_telemetry(point_metadata()?);
        Ok(Self { descriptor })
    }
}

#[async_trait]
impl ObjectProvider for PointProvider {
    fn applies_to(&self, identifier: &Identifier) -> bool {
        identifier.key == POINT_KEY
    }

    async fn get(&self, identifier: &Identifier) -> Option<ObjectDescriptor> {
        (*identifier == self.descriptor.identifier).then(|| self.descriptor.clone())
    }
}

/// Resolves the folder listed under the root.
pub struct FolderProvider;

#[async_trait]
impl ObjectProvider for FolderProvider {
    fn applies_to(&self, identifier: &Identifier) -> bool {
        identifier.key == ROOT_KEY
    }

    async fn get(&self, identifier: &Identifier) -> Option<ObjectDescriptor> {
        Some(
            ObjectDescriptor::new(identifier.clone(), "Example Telemetry", FOLDER_TYPE)
                .with_location(Location::Root)
                .with_composition(vec![point_identifier()]),
        )
    }
}

/// Builds the plugin module around the multiplexer that carries live samples.
pub fn module(multiplexer: Arc<SubscriptionMultiplexer>) -> Result<ModuleDescriptor, MetadataError> {
    Ok(ModuleDescriptor::builder(MODULE_ID)
        .object_type(ObjectType::new(
            POINT_TYPE,
            "Balloon Telemetry Point",
            "Live position and environment readings from the HABET tracker",
        ))
        .object_provider(NAMESPACE, PointProvider::new()?)
        .root(root_identifier())
        .object_provider(NAMESPACE, FolderProvider)
        .telemetry_provider(LiveTelemetryProvider::new(POINT_TYPE, [point_identifier()], multiplexer))
        .build())
}

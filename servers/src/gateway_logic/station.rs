//! Wires the module catalog, the provider chains and the ingestion adapter
//! into one running station.

use anyhow::{Context, Result};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use lib_groundstation::configs::ModuleManifest;
use lib_groundstation::core::{
    ExtensionComposer, Identifier, ModuleRegistry, ObjectDescriptor, ObjectProviderChain, Subscription,
    TelemetryDatum, TelemetryProviderChain,
};
use lib_groundstation::ingestors::IngestionAdapter;
use lib_groundstation::plugins;

pub struct Station {
    pub registry: Arc<ModuleRegistry>,
    pub objects: ObjectProviderChain,
    pub telemetry: TelemetryProviderChain,
}

impl Station {
    /// Declares the catalog on a fresh registry. A missing manifest enables
    /// every catalog module in catalog order.
    pub fn assemble(modules_path: &Path, adapter: &IngestionAdapter) -> Result<Self> {
        let catalog = plugins::catalog(Arc::clone(adapter.multiplexer()))?;

        let manifest = if modules_path.exists() {
            ModuleManifest::load(modules_path)?
        } else {
            log::info!(
                "Module manifest {} not found. Enabling all {} built-in module(s).",
                modules_path.display(),
                catalog.len()
            );
            ModuleManifest::enable_all(&catalog)
        };

        let registry = Arc::new(ModuleRegistry::new());
        manifest
            .declare_into(&registry, catalog)
            .context("failed to declare modules")?;

        for module in registry.list() {
            log::info!("Module '{}' enabled ({} extension(s))", module.id, module.extensions.len());
        }

        let composer = Arc::new(ExtensionComposer::new(Arc::clone(&registry)));
        Ok(Self {
            registry,
            objects: ObjectProviderChain::new(Arc::clone(&composer)),
            telemetry: TelemetryProviderChain::new(composer),
        })
    }

    /// Walks the object tree from the root and returns every object a
    /// telemetry provider can serve.
    pub async fn telemetry_points(&self) -> Vec<ObjectDescriptor> {
        let mut points = Vec::new();
        let mut seen: HashSet<Identifier> = HashSet::new();
        let mut queue: VecDeque<Identifier> = VecDeque::from([Identifier::root()]);

        while let Some(identifier) = queue.pop_front() {
            if !seen.insert(identifier.clone()) {
                continue;
            }
            let Some(object) = self.objects.get(&identifier).await else {
                log::warn!("Object {} is listed but no provider resolves it", identifier);
                continue;
            };
            queue.extend(object.composition.iter().cloned());
            if self.telemetry.supports_subscribe(&object) {
                points.push(object);
            }
        }
        points
    }

    /// Subscribes a logging sink to every point.
    pub fn log_points(&self, points: &[ObjectDescriptor]) -> Vec<Subscription> {
        points
            .iter()
            .filter_map(|point| {
                let name = point.name.clone();
                let sink = Arc::new(move |datum: &TelemetryDatum| match serde_json::to_string(&datum.values) {
                    Ok(values) => tracing::info!(target: "telemetry", "{}: {}", name, values),
                    Err(e) => tracing::warn!("Failed to encode sample of {}: {}", name, e),
                });
                match self.telemetry.subscribe(point, sink) {
                    Ok(subscription) => {
                        log::info!("Subscribed to {} ({})", point.name, point.identifier);
                        Some(subscription)
                    }
                    Err(e) => {
                        log::warn!("{}", e);
                        None
                    }
                }
            })
            .collect()
    }
}

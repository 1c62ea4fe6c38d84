//! # Object Provider Chain
//!
//! Resolves identifiers to descriptors by asking the composed object providers
//! in order. The first provider that claims the identifier and returns a
//! descriptor wins; nothing after it is queried. "Not found" is a normal
//! outcome and is reported as `None`.
//!
//! The root sentinel never reaches a provider. It resolves to a virtual folder
//! listing the roots contributed by enabled modules.
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::core::composer::ExtensionComposer;
use crate::core::registry::{Extension, ExtensionCategory};
use crate::core::types::{Identifier, ObjectDescriptor};

/// Type key of the virtual root object.
pub const ROOT_TYPE: &str = "root";

/// A source of object descriptors for one namespace.
#[async_trait]
pub trait ObjectProvider: Send + Sync {
    /// Whether this provider recognises `identifier`. The chain only calls it
    /// for identifiers in the namespace the provider was registered under.
    fn applies_to(&self, _identifier: &Identifier) -> bool {
        true
    }

    /// Resolves `identifier`, or `None` to let the next provider try.
    async fn get(&self, identifier: &Identifier) -> Option<ObjectDescriptor>;
}

pub struct ObjectProviderChain {
    composer: Arc<ExtensionComposer>,
}

impl ObjectProviderChain {
    pub fn new(composer: Arc<ExtensionComposer>) -> Self {
        Self { composer }
    }

    /// Resolves `identifier` against the current composition.
    pub async fn get(&self, identifier: &Identifier) -> Option<ObjectDescriptor> {
        if identifier.is_root() {
            return Some(self.root_descriptor());
        }

        let providers = self.composer.compose(ExtensionCategory::ObjectProviders);
        for contribution in providers.iter() {
            let Extension::ObjectProvider { namespace, provider } = &contribution.extension else {
                continue;
            };
            if *namespace != identifier.namespace || !provider.applies_to(identifier) {
                continue;
            }

            let resolved = provider.get(identifier).await;

            // The module may have been disabled while the query was running.
            if !self.composer.registry().is_enabled(&contribution.module_id) {
                log::debug!(
                    "Discarding stale result for {} from disabled module '{}'",
                    identifier,
                    contribution.module_id
                );
                continue;
            }
            if let Some(descriptor) = resolved {
                return Some(descriptor);
            }
        }

        log::debug!("No object provider resolved {}", identifier);
        None
    }

    /// Roots contributed by enabled modules, first contribution wins.
    pub fn roots(&self) -> Vec<Identifier> {
        let mut seen = HashSet::new();
        self.composer
            .compose(ExtensionCategory::Roots)
            .iter()
            .filter_map(|c| match &c.extension {
                Extension::Root(id) => Some(id.clone()),
                _ => None,
            })
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }

    fn root_descriptor(&self) -> ObjectDescriptor {
        ObjectDescriptor::new(Identifier::root(), "The root object", ROOT_TYPE)
            .with_composition(self.roots())
    }
}

//! # Extension Composer
//!
//! Flattens the extensions of enabled modules into one ordered list per
//! category: module declaration order first, then the order inside a module.
//!
//! Compositions are cached per category and tagged with the registry
//! generation they were built from. A lookup whose generation no longer
//! matches rebuilds the list, so a composition is never stale after an
//! `enable` or `disable`.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::registry::{Extension, ExtensionCategory, ModuleRegistry};

/// An extension together with the module that declared it.
#[derive(Debug, Clone)]
pub struct Contribution {
    pub module_id: String,
    pub extension: Extension,
}

struct CachedComposition {
    generation: u64,
    contributions: Arc<[Contribution]>,
}

pub struct ExtensionComposer {
    registry: Arc<ModuleRegistry>,
    cache: Mutex<HashMap<ExtensionCategory, CachedComposition>>,
}

impl ExtensionComposer {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    /// Ordered contributions of all enabled modules to `category`.
    pub fn compose(&self, category: ExtensionCategory) -> Arc<[Contribution]> {
        let current = self.registry.generation();
        {
            let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache.get(&category) {
                if cached.generation == current {
                    return Arc::clone(&cached.contributions);
                }
            }
        }

        // Generation and module list come from one read so they always agree.
        let (generation, modules) = self.registry.snapshot();
        let contributions: Arc<[Contribution]> = modules
            .into_iter()
            .flat_map(|module| {
                let module_id = module.id;
                module
                    .extensions
                    .into_iter()
                    .filter(|extension| extension.category() == category)
                    .map(move |extension| Contribution {
                        module_id: module_id.clone(),
                        extension,
                    })
            })
            .collect();

        log::trace!(
            "Composed {} contribution(s) for {:?} at generation {}",
            contributions.len(),
            category,
            generation
        );

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let newer_cached = cache
            .get(&category)
            .map(|cached| cached.generation > generation)
            .unwrap_or(false);
        if !newer_cached {
            cache.insert(
                category,
                CachedComposition {
                    generation,
                    contributions: Arc::clone(&contributions),
                },
            );
        }
        contributions
    }
}

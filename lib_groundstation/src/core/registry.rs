//! # Module Registry
//!
//! Holds every declared module together with its enabled flag. Declaration
//! order is load-bearing: the composer walks modules in this order, so a module
//! declared later is consulted after the ones declared before it.
//!
//! Every mutation bumps a generation counter. Readers that cache derived state
//! (the composer) compare generations instead of subscribing to changes.
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;

use crate::core::objects::ObjectProvider;
use crate::core::telemetry::TelemetryProvider;
use crate::core::types::{Identifier, ObjectType};

/// Misuse of the registry. These are programmer errors and are expected to
/// abort start-up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("module '{0}' is already declared")]
    DuplicateModule(String),
    #[error("module '{0}' is not declared")]
    UnknownModule(String),
}

/// The categories modules can contribute to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionCategory {
    ObjectProviders,
    TelemetryProviders,
    Roots,
    Types,
}

/// One contribution of a module.
#[derive(Clone)]
pub enum Extension {
    /// Resolves identifiers inside `namespace`.
    ObjectProvider {
        namespace: String,
        provider: Arc<dyn ObjectProvider>,
    },
    /// Candidate owner of live delivery.
    TelemetryProvider(Arc<dyn TelemetryProvider>),
    /// A top-level object listed under the root sentinel.
    Root(Identifier),
    /// An object type definition.
    Type(ObjectType),
}

impl Extension {
    pub fn category(&self) -> ExtensionCategory {
        match self {
            Extension::ObjectProvider { .. } => ExtensionCategory::ObjectProviders,
            Extension::TelemetryProvider(_) => ExtensionCategory::TelemetryProviders,
            Extension::Root(_) => ExtensionCategory::Roots,
            Extension::Type(_) => ExtensionCategory::Types,
        }
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extension::ObjectProvider { namespace, .. } => {
                f.debug_struct("ObjectProvider").field("namespace", namespace).finish()
            }
            Extension::TelemetryProvider(_) => f.write_str("TelemetryProvider"),
            Extension::Root(id) => f.debug_tuple("Root").field(id).finish(),
            Extension::Type(t) => f.debug_tuple("Type").field(&t.key).finish(),
        }
    }
}

/// # Module Descriptor
///
/// A declared unit of extensions. Only `enabled` changes after declaration.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub id: String,
    pub extensions: Vec<Extension>,
    pub enabled: bool,
}

impl ModuleDescriptor {
    /// Starts a module declaration. Modules are enabled unless told otherwise.
    pub fn builder(id: impl Into<String>) -> ModuleBuilder {
        ModuleBuilder {
            id: id.into(),
            extensions: Vec::new(),
            enabled: true,
        }
    }
}

/// Collects a module's extensions in declaration order.
pub struct ModuleBuilder {
    id: String,
    extensions: Vec<Extension>,
    enabled: bool,
}

impl ModuleBuilder {
    /// Registers an object provider for `namespace`.
    pub fn object_provider(mut self, namespace: &str, provider: impl ObjectProvider + 'static) -> Self {
        self.extensions.push(Extension::ObjectProvider {
            namespace: namespace.to_string(),
            provider: Arc::new(provider),
        });
        self
    }

    pub fn telemetry_provider(mut self, provider: impl TelemetryProvider + 'static) -> Self {
        self.extensions.push(Extension::TelemetryProvider(Arc::new(provider)));
        self
    }

    /// Lists `identifier` under the root sentinel.
    pub fn root(mut self, identifier: Identifier) -> Self {
        self.extensions.push(Extension::Root(identifier));
        self
    }

    pub fn object_type(mut self, object_type: ObjectType) -> Self {
        self.extensions.push(Extension::Type(object_type));
        self
    }

    pub fn extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn build(self) -> ModuleDescriptor {
        ModuleDescriptor {
            id: self.id,
            extensions: self.extensions,
            enabled: self.enabled,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    modules: Vec<ModuleDescriptor>,
    index: HashMap<String, usize>,
    generation: u64,
}

/// # Module Registry
///
/// Thread-safe store of declared modules. Pass it around as an
/// `Arc<ModuleRegistry>`; there is no global instance.
#[derive(Default)]
pub struct ModuleRegistry {
    state: RwLock<RegistryState>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a module. Fails if a module with the same id exists.
    pub fn declare(&self, module: ModuleDescriptor) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.index.contains_key(&module.id) {
            return Err(RegistryError::DuplicateModule(module.id));
        }

        log::debug!(
            "Declared module '{}' with {} extension(s), enabled={}",
            module.id,
            module.extensions.len(),
            module.enabled
        );
        let position = state.modules.len();
        state.index.insert(module.id.clone(), position);
        state.modules.push(module);
        state.generation += 1;
        Ok(())
    }

    pub fn enable(&self, id: &str) -> Result<(), RegistryError> {
        self.set_enabled(id, true)
    }

    pub fn disable(&self, id: &str) -> Result<(), RegistryError> {
        self.set_enabled(id, false)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), RegistryError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let position = *state
            .index
            .get(id)
            .ok_or_else(|| RegistryError::UnknownModule(id.to_string()))?;

        let module = &mut state.modules[position];
        if module.enabled != enabled {
            module.enabled = enabled;
            state.generation += 1;
            log::info!("Module '{}' {}", id, if enabled { "enabled" } else { "disabled" });
        }
        Ok(())
    }

    /// Enabled modules in declaration order.
    pub fn list(&self) -> Vec<ModuleDescriptor> {
        self.snapshot().1
    }

    /// Enabled modules together with the generation they were read at.
    pub fn snapshot(&self) -> (u64, Vec<ModuleDescriptor>) {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let enabled = state.modules.iter().filter(|m| m.enabled).cloned().collect();
        (state.generation, enabled)
    }

    /// Ids of every declared module, enabled or not, in declaration order.
    pub fn declared(&self) -> Vec<String> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.modules.iter().map(|m| m.id.clone()).collect()
    }

    /// False for disabled and for undeclared modules.
    pub fn is_enabled(&self, id: &str) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .index
            .get(id)
            .map(|&position| state.modules[position].enabled)
            .unwrap_or(false)
    }

    pub fn generation(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).generation
    }
}

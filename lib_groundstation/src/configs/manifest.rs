//! # Module Manifest
//!
//! The static, ordered list of modules a process starts with. It is read once
//! at startup from a JSON5 file:
//!
//! ```json5
//! {
//!   // Declaration order is priority order.
//!   modules: [
//!     { id: "platform/core" },
//!     { id: "example/habet", enabled: true },
//!     { id: "example/replay", enabled: false },
//!   ],
//! }
//! ```
//!
//! The manifest only names modules. Their extensions come from a catalog of
//! [`ModuleDescriptor`]s built in code.

use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::core::registry::{ModuleDescriptor, ModuleRegistry, RegistryError};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest: {0}")]
    Parse(#[from] json5::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ModuleManifest {
    #[serde(default)]
    pub modules: Vec<ManifestEntry>,
}

impl ModuleManifest {
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        Ok(json5::from_str(text)?)
    }

    /// Every catalog module, enabled, in catalog order.
    pub fn enable_all(catalog: &[ModuleDescriptor]) -> Self {
        Self {
            modules: catalog
                .iter()
                .map(|m| ManifestEntry {
                    id: m.id.clone(),
                    enabled: true,
                })
                .collect(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// # Declare Into
    ///
    /// Declares the catalog modules on `registry` in manifest order, with the
    /// manifest's enabled flags. Catalog modules the manifest does not name are
    /// declared afterwards, disabled, so they can still be enabled at runtime.
    ///
    /// An id listed in the manifest but missing from the catalog fails with
    /// `UnknownModule`; an id listed twice fails with `DuplicateModule`.
    pub fn declare_into(
        &self,
        registry: &ModuleRegistry,
        catalog: Vec<ModuleDescriptor>,
    ) -> Result<(), ManifestError> {
        let mut remaining = catalog;

        for entry in &self.modules {
            let Some(position) = remaining.iter().position(|m| m.id == entry.id) else {
                if registry.declared().contains(&entry.id) {
                    return Err(RegistryError::DuplicateModule(entry.id.clone()).into());
                }
                return Err(RegistryError::UnknownModule(entry.id.clone()).into());
            };

            let mut module = remaining.remove(position);
            module.enabled = entry.enabled;
            registry.declare(module)?;
        }

        for mut module in remaining {
            log::debug!("Module '{}' is not in the manifest; declaring it disabled", module.id);
            module.enabled = false;
            registry.declare(module)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Identifier;
    use std::io::Write;

    fn catalog() -> Vec<ModuleDescriptor> {
        ["a", "b", "c"]
            .iter()
            .map(|id| ModuleDescriptor::builder(*id).root(Identifier::new(*id, "root")).build())
            .collect()
    }

    #[test]
    fn manifest_order_and_flags_drive_declaration() {
        let manifest = ModuleManifest::parse(
            r#"{
                // priority order
                modules: [
                    { id: "c" },
                    { id: "a", enabled: false },
                ],
            }"#,
        )
        .unwrap();

        let registry = ModuleRegistry::new();
        manifest.declare_into(&registry, catalog()).unwrap();

        assert_eq!(registry.declared(), vec!["c", "a", "b"]);
        assert!(registry.is_enabled("c"));
        assert!(!registry.is_enabled("a"));
        assert!(!registry.is_enabled("b"));
    }

    #[test]
    fn enable_all_keeps_catalog_order() {
        let registry = ModuleRegistry::new();
        let catalog = catalog();
        ModuleManifest::enable_all(&catalog).declare_into(&registry, catalog).unwrap();

        let enabled: Vec<String> = registry.list().into_iter().map(|m| m.id).collect();
        assert_eq!(enabled, vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_and_repeated_ids_fail_fast() {
        let registry = ModuleRegistry::new();
        let unknown = ModuleManifest::parse("{ modules: [{ id: 'zzz' }] }").unwrap();
        assert!(matches!(
            unknown.declare_into(&registry, catalog()),
            Err(ManifestError::Registry(RegistryError::UnknownModule(id))) if id == "zzz"
        ));

        let registry = ModuleRegistry::new();
        let twice = ModuleManifest::parse("{ modules: [{ id: 'a' }, { id: 'a' }] }").unwrap();
        assert!(matches!(
            twice.declare_into(&registry, catalog()),
            Err(ManifestError::Registry(RegistryError::DuplicateModule(id))) if id == "a"
        ));
    }

    #[test]
    fn load_reads_json5_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ modules: [{{ id: 'b', enabled: true }},] }}").unwrap();

        let manifest = ModuleManifest::load(file.path()).unwrap();
        assert_eq!(
            manifest.modules,
            vec![ManifestEntry { id: "b".into(), enabled: true }]
        );

        assert!(matches!(
            ModuleManifest::load("/definitely/not/here.json5"),
            Err(ManifestError::Io { .. })
        ));
        assert!(matches!(ModuleManifest::parse("{ modules: "), Err(ManifestError::Parse(_))));
    }
}

/// Mod directory: loads declarative mods from `<root>/<name>.json`.
///
/// Every compile re-reads the file, so editing a manifest and reloading the
/// mod picks up the change. Only top-level manifests are offered for
/// autoload; libraries conventionally live in a subdirectory (`lib/`) and are
/// referenced as `lib/<name>` from `requires`.
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::error::ModError;
use crate::loader::Requirer;
use crate::manifest::{ModManifest, ScriptedMod};
use crate::source::{ModDiscovery, Module, ModuleSource, SourceId};

const MANIFEST_EXT: &str = "json";

pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest path for `name`, or `None` when the name would escape the root.
    pub fn path_for(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let contained = !name.is_empty()
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        contained.then(|| self.root.join(format!("{name}.{MANIFEST_EXT}")))
    }
}

impl ModuleSource for DirectorySource {
    fn resolve(&self, name: &str) -> Result<SourceId, ModError> {
        match self.path_for(name) {
            Some(path) if path.is_file() => Ok(SourceId::new(path.to_string_lossy())),
            _ => Err(ModError::Unresolved(name.to_string())),
        }
    }

    fn compile(&self, id: &SourceId, requirer: &Requirer<'_>) -> Result<Module> {
        let text = std::fs::read_to_string(id.as_str())
            .with_context(|| format!("read manifest {id}"))?;
        let manifest =
            ModManifest::from_json(&text).with_context(|| format!("parse manifest {id}"))?;

        let mut libraries = Vec::with_capacity(manifest.requires.len());
        for name in &manifest.requires {
            let library = requirer.require_library::<ModManifest>(name)?;
            libraries.push((name.clone(), library));
        }
        debug!(module = %id, requires = libraries.len(), library = manifest.library, "Parsed manifest");

        if manifest.library {
            return Ok(Module::Library(Arc::new(manifest)));
        }
        Ok(Module::entry(ScriptedMod::new(manifest, libraries)))
    }
}

impl ModDiscovery for DirectorySource {
    fn discover(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            debug!(root = %self.root.display(), "Mod directory does not exist");
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.root)
            .with_context(|| format!("read mod directory {}", self.root.display()))?;
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|ext| ext.to_str()) != Some(MANIFEST_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

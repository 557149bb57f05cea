//! Engine Plugins - Dynamic Loading of Script Engines
//!
//! Hosts rarely compile every scripting language in. This module loads
//! [`ScriptEngine`] implementations from shared libraries with libloading,
//! so a deployment can drop a `.so` next to the server and serve a new
//! language without rebuilding.
//!
//! # Safety Model:
//! - Plugins must be built with the same Rust toolchain as the host
//! - Each library stays loaded for as long as any engine from it may live
//! - Loading is `&mut self`; callers serialize it during startup

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use libloading::{Library, Symbol};
use tracing::{debug, info, warn};

use crate::engine::{EngineRegistry, ScriptEngine};

/// Metadata exported by an engine plugin.
#[derive(Debug, Clone)]
pub struct EngineDescriptor {
    /// Engine type name (e.g. `"tcl"`, `"lua"`).
    pub name: String,
    /// Plugin version.
    pub version: String,
    /// Human-readable description.
    pub description: String,
}

/// Required export: construct the engine.
type CreateEngineFn = unsafe extern "C" fn() -> *mut dyn ScriptEngine;

/// Required export: describe the plugin.
type DescriptorFn = unsafe extern "C" fn() -> EngineDescriptor;

/// Loader and owner of engine plugin libraries.
///
/// Libraries are kept alive in the registry to prevent symbol unloading
/// while engines created from them are still in use.
pub struct EnginePlugins {
    libraries: HashMap<String, Library>,
    descriptors: HashMap<String, EngineDescriptor>,
    search_paths: Vec<PathBuf>,
}

impl EnginePlugins {
    pub fn new() -> Self {
        Self {
            libraries: HashMap::new(),
            descriptors: HashMap::new(),
            search_paths: vec![
                PathBuf::from("./engines"),
                PathBuf::from("/usr/lib/interpool/engines"),
                PathBuf::from("/usr/local/lib/interpool/engines"),
            ],
        }
    }

    /// Add a directory to scan during [`discover`](Self::discover).
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.push(path);
    }

    /// Load one engine plugin from a shared library.
    pub fn load_engine(&mut self, name: String, path: PathBuf) -> Result<Arc<dyn ScriptEngine>> {
        info!(plugin = %name, ?path, "loading engine plugin");

        if self.libraries.contains_key(&name) {
            bail!("engine plugin '{name}' is already loaded");
        }

        let library = unsafe {
            Library::new(&path)
                .with_context(|| format!("failed to load library from {path:?}"))?
        };

        let descriptor = unsafe {
            let describe: Symbol<DescriptorFn> = library
                .get(b"engine_descriptor")
                .context("plugin missing 'engine_descriptor' export")?;
            describe()
        };
        debug!(
            engine = %descriptor.name,
            version = %descriptor.version,
            "engine plugin described itself"
        );

        let engine: Arc<dyn ScriptEngine> = unsafe {
            let create: Symbol<CreateEngineFn> = library
                .get(b"create_engine")
                .context("plugin missing 'create_engine' export")?;
            Arc::from(Box::from_raw(create()))
        };

        self.libraries.insert(name.clone(), library);
        self.descriptors.insert(name.clone(), descriptor);
        info!(plugin = %name, "engine plugin loaded");
        Ok(engine)
    }

    /// Unload a plugin library.
    ///
    /// # Safety:
    /// Dropping the library calls `dlclose()`. Undefined behavior if any
    /// engine or context created from this plugin is still alive; callers
    /// must tear those down first.
    pub fn unload(&mut self, name: &str) -> Result<()> {
        info!(plugin = %name, "unloading engine plugin");
        self.libraries
            .remove(name)
            .with_context(|| format!("engine plugin '{name}' is not loaded"))?;
        self.descriptors.remove(name);
        Ok(())
    }

    /// Metadata for a loaded plugin.
    pub fn descriptor(&self, name: &str) -> Option<&EngineDescriptor> {
        self.descriptors.get(name)
    }

    /// Names of all loaded plugins.
    pub fn list(&self) -> Vec<String> {
        self.libraries.keys().cloned().collect()
    }

    /// Scan the search paths, load every shared library found, and register
    /// the engines into `registry`. Individual load failures are logged and
    /// skipped.
    pub fn discover(&mut self, registry: &mut EngineRegistry) -> Result<Vec<String>> {
        let mut discovered = Vec::new();
        let search_paths = self.search_paths.clone();

        for search_path in &search_paths {
            if !search_path.exists() {
                debug!(?search_path, "plugin search path does not exist, skipping");
                continue;
            }
            debug!(?search_path, "scanning for engine plugins");

            let entries = std::fs::read_dir(search_path)
                .with_context(|| format!("failed to read directory {search_path:?}"))?;

            for entry in entries {
                let path = entry?.path();
                let Some(ext) = path.extension() else {
                    continue;
                };
                if ext != "so" && ext != "dylib" && ext != "dll" {
                    continue;
                }
                let Some(stem) = path.file_stem() else {
                    continue;
                };
                let name = stem.to_string_lossy().to_string();

                match self.load_engine(name.clone(), path) {
                    Ok(engine) => {
                        registry.register(name.clone(), engine);
                        discovered.push(name);
                    }
                    Err(err) => warn!(plugin = %name, error = %err, "failed to load engine plugin"),
                }
            }
        }

        info!(count = discovered.len(), "engine plugin discovery finished");
        Ok(discovered)
    }
}

impl Default for EnginePlugins {
    fn default() -> Self {
        Self::new()
    }
}

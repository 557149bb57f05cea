//! Identity Mapping - Requested Path to Canonical Cache Key
//!
//! A single shared mapping evaluator decides which class a requested script
//! path belongs to. By default each path maps to itself, but a host can
//! install a program that folds many request paths onto one cache key
//! (e.g. every path under `/shop/` served by one controller script).
//!
//! The evaluator is loaded once per process and is not reentrancy-safe, so
//! every evaluation serializes behind its own lock. That lock is distinct
//! from any registry lock; resolution always happens *before* the registry
//! is locked.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;
use tracing::debug;

/// Maps a requested script path to its canonical class identity.
///
/// Failure means the current request cannot be served; the caller must
/// abort without touching the registry.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, requested: &Path) -> Result<PathBuf>;
}

type MappingProgram = Box<dyn Fn(&Path) -> Result<PathBuf> + Send>;

/// The process-wide mapping evaluator.
///
/// Holds one mapping program behind a dedicated mutex; concurrent
/// resolutions block each other, never the registries.
pub struct ScriptedResolver {
    program: Mutex<MappingProgram>,
}

impl ScriptedResolver {
    /// The default mapping: every requested path is its own identity.
    pub fn identity() -> Self {
        Self::with_program(|requested| Ok(requested.to_path_buf()))
    }

    /// Install a custom mapping program.
    pub fn with_program<F>(program: F) -> Self
    where
        F: Fn(&Path) -> Result<PathBuf> + Send + 'static,
    {
        Self {
            program: Mutex::new(Box::new(program)),
        }
    }
}

impl IdentityResolver for ScriptedResolver {
    fn resolve(&self, requested: &Path) -> Result<PathBuf> {
        let program = self
            .program
            .lock()
            .expect("mapping evaluator lock poisoned");
        let canonical = program(requested)?;
        debug!(
            requested = %requested.display(),
            canonical = %canonical.display(),
            "interpmap"
        );
        Ok(canonical)
    }
}

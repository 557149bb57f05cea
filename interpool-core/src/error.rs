//! Pool Error Surface
//!
//! Acquisition can fail at four points: identity mapping, source stat,
//! context creation, and stale-handle release. Each failure aborts the
//! current request only; cache state for other identities is never touched.
//! Code-load failures are deliberately *not* here: an instance without code
//! is still pooled and returned, so the caller's execution attempt fails
//! predictably and visibly.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by pool acquisition and release.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The identity mapping evaluator rejected the requested path.
    #[error("identity mapping failed for '{}'", .path.display())]
    Mapping {
        /// The requested (pre-mapping) path.
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// The resolved source file could not be accessed or stat'ed. The
    /// existing class, if any, is left exactly as it was.
    #[error("cannot access or stat class source '{}'", .path.display())]
    Stat {
        /// The canonical class identity.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine failed to allocate or initialize a fresh execution
    /// context. No partial instance is registered.
    #[error("could not create interpreter (class '{}')", .identity.display())]
    Creation {
        identity: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    /// A handle was released into a pool that no longer tracks the
    /// instance (e.g. after a scope teardown).
    #[error("no pooled instance {id} in class '{}'", .identity.display())]
    NoSuchInstance { identity: PathBuf, id: u64 },
}

//! Interpreter Pool - Class Cache, Instance Lifecycle, and Registries
//!
//! Creating a script execution context per request is expensive; keeping
//! one forever risks stale code and unbounded growth. This module amortizes
//! context creation across requests by caching instances per script
//! identity ("class"), bounding their lifetime by request-count, idle, and
//! ttl policies, and invalidating them when the source changes — all
//! without ever interrupting an execution in flight.
//!
//! Two registry scopes exist:
//! - [`InterpPool`]: one registry per concurrency domain, lock-free.
//! - [`SharedInterpPool`]: one process-wide registry behind a mutex.
//!
//! Execution contexts are not transferable between domains. Every pool call
//! takes the caller's [`DomainId`] explicitly rather than reading ambient
//! thread state, which keeps ownership rules testable without real threads.

mod class;
mod instance;
mod policy;
mod registry;
mod shared;

pub use class::InterpClass;
pub use instance::{Interp, InterpLease, InterpState};
pub use policy::{ClassPolicy, PoolConfig};
pub use registry::{InterpPool, PoolStats};
pub use shared::SharedInterpPool;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a concurrency domain (typically one OS thread).
///
/// Compared only for equality: the pool cares about "same domain or not",
/// never about ordering or numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainId(u64);

impl DomainId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Domain id derived from the calling OS thread.
    pub fn current_thread() -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        Self(hasher.finish())
    }
}

//! Shared Interpreter Registry - One Pool Across Concurrency Domains
//!
//! Some deployments want every worker thread to consult a single
//! class/instance cache instead of one registry per domain. This variant
//! wraps [`InterpPool`] in a mutex: every cache mutation (create,
//! reconcile, reserve, release, sweep, teardown) serializes on that lock.
//!
//! Domain affinity still holds. Instances are only ever reserved by and
//! engine-torn-down from their owning domain; the only cross-domain
//! operations are metadata flags. A context whose instance is destroyed by
//! a foreign domain is unlinked but not torn down, and its engine-side
//! resources are not reclaimed until the owning domain sweeps or exits.
//!
//! Identity mapping runs on the resolver's own lock *before* the registry
//! lock is taken, never under it.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use crate::engine::ScriptEngine;
use crate::error::PoolError;
use crate::mapping::IdentityResolver;
use crate::pool::instance::InterpLease;
use crate::pool::policy::{ClassPolicy, PoolConfig};
use crate::pool::registry::{InterpPool, PoolStats};
use crate::pool::DomainId;

/// Mutex-guarded registry shared by all concurrency domains.
///
/// Cloning is cheap and yields another handle onto the same pool, so each
/// worker can hold its own copy.
pub struct SharedInterpPool {
    resolver: Arc<dyn IdentityResolver>,
    inner: Arc<Mutex<InterpPool>>,
}

impl SharedInterpPool {
    pub fn new(engine: Arc<dyn ScriptEngine>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self::with_config(engine, resolver, PoolConfig::default())
    }

    pub fn with_config(
        engine: Arc<dyn ScriptEngine>,
        resolver: Arc<dyn IdentityResolver>,
        config: PoolConfig,
    ) -> Self {
        Self {
            resolver: resolver.clone(),
            inner: Arc::new(Mutex::new(InterpPool::with_config(
                engine, resolver, config,
            ))),
        }
    }

    /// Acquire an instance for `requested` on behalf of `domain`.
    pub fn acquire(
        &self,
        domain: DomainId,
        requested: &Path,
        observed_mtime: SystemTime,
    ) -> Result<InterpLease, PoolError> {
        // Resolve before locking the registry: the mapping evaluator has
        // its own serialization and can be slow.
        let canonical = self
            .resolver
            .resolve(requested)
            .map_err(|source| PoolError::Mapping {
                path: requested.to_path_buf(),
                source,
            })?;
        self.lock()
            .acquire_resolved(domain, canonical, requested, observed_mtime)
    }

    /// Return a lease, then sweep the whole registry for the releasing
    /// domain.
    pub fn release(&self, lease: InterpLease) -> Result<(), PoolError> {
        let domain = lease.domain();
        let mut pool = self.lock();
        let result = pool.release(lease);
        pool.sweep(domain);
        result
    }

    /// Flag one instance expired. Callable from any domain.
    pub fn mark_expired(&self, identity: &Path, id: u64) -> bool {
        self.lock().mark_expired(identity, id)
    }

    /// Set the policy for an identity.
    pub fn configure_class_policy(&self, identity: &Path, policy: ClassPolicy) {
        self.lock().configure_class_policy(identity, policy)
    }

    /// Sweep every class on behalf of `domain`.
    pub fn sweep(&self, domain: DomainId) {
        self.lock().sweep(domain)
    }

    /// Destroy every class and instance unconditionally. Contexts owned by
    /// domains other than the caller are unlinked without engine teardown.
    pub fn teardown(&self, domain: DomainId) {
        self.lock().teardown(domain)
    }

    /// Snapshot current registry statistics.
    pub fn stats(&self) -> PoolStats {
        self.lock().stats()
    }

    fn lock(&self) -> MutexGuard<'_, InterpPool> {
        self.inner
            .lock()
            .expect("interpreter pool lock poisoned")
    }
}

impl Clone for SharedInterpPool {
    fn clone(&self) -> Self {
        Self {
            resolver: self.resolver.clone(),
            inner: self.inner.clone(),
        }
    }
}

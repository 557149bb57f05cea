//! Domain-Local Interpreter Registry
//!
//! Maps canonical script identities to classes for one concurrency domain.
//! Because every instance in it is created, executed, and destroyed by the
//! same domain, no lock is needed; the shared, cross-domain variant wraps
//! this type in a mutex (see [`super::shared`]).
//!
//! Classes are created on first reference and kept until teardown, even
//! when their instance list drains: dropping a class would discard its
//! compiled-code cache and hurt steady-state reuse.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::engine::ScriptEngine;
use crate::error::PoolError;
use crate::mapping::IdentityResolver;
use crate::pool::class::InterpClass;
use crate::pool::instance::InterpLease;
use crate::pool::policy::{ClassPolicy, PoolConfig};
use crate::pool::DomainId;
use crate::source::stat_source;

/// Snapshot of registry utilization.
///
/// Operators use these counters to judge policy settings: a low
/// `reuse_hits`-to-`created` ratio usually means `max_requests` is set too
/// tight for the traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Classes currently cached.
    pub classes: usize,
    /// Pooled instances across all classes, in any state.
    pub live_instances: usize,
    /// Acquisitions served by reusing a free instance.
    pub reuse_hits: u64,
    /// Instances created.
    pub created: u64,
    /// Instances destroyed or unlinked.
    pub destroyed: u64,
    /// Times an instance was flagged expired, for any reason.
    pub expired: u64,
    /// Highest `live_instances` observed.
    pub peak_live: usize,
}

/// Registry of interpreter classes for one concurrency domain.
pub struct InterpPool {
    engine: Arc<dyn ScriptEngine>,
    resolver: Arc<dyn IdentityResolver>,
    config: PoolConfig,
    classes: HashMap<PathBuf, InterpClass>,
    reuse_hits: u64,
    created: u64,
    destroyed: u64,
    expired: u64,
    peak_live: usize,
}

impl InterpPool {
    pub fn new(engine: Arc<dyn ScriptEngine>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self::with_config(engine, resolver, PoolConfig::default())
    }

    pub fn with_config(
        engine: Arc<dyn ScriptEngine>,
        resolver: Arc<dyn IdentityResolver>,
        config: PoolConfig,
    ) -> Self {
        info!(engine = engine.engine_type(), "creating interpreter pool");
        Self {
            engine,
            resolver,
            config,
            classes: HashMap::new(),
            reuse_hits: 0,
            created: 0,
            destroyed: 0,
            expired: 0,
            peak_live: 0,
        }
    }

    /// Acquire an instance for `requested`, reusing a free one owned by
    /// `domain` when possible.
    ///
    /// `observed_mtime` is the modification time the serving layer saw when
    /// it mapped the request to a file; it drives source-change detection
    /// without a second stat on the hot path.
    pub fn acquire(
        &mut self,
        domain: DomainId,
        requested: &Path,
        observed_mtime: SystemTime,
    ) -> Result<InterpLease, PoolError> {
        let canonical = self
            .resolver
            .resolve(requested)
            .map_err(|source| PoolError::Mapping {
                path: requested.to_path_buf(),
                source,
            })?;
        self.acquire_resolved(domain, canonical, requested, observed_mtime)
    }

    /// Acquisition after identity resolution. The shared registry resolves
    /// outside its lock and enters here.
    pub(crate) fn acquire_resolved(
        &mut self,
        domain: DomainId,
        canonical: PathBuf,
        requested: &Path,
        observed_mtime: SystemTime,
    ) -> Result<InterpLease, PoolError> {
        let now = SystemTime::now();
        let engine = self.engine.clone();

        let class = match self.classes.entry(canonical.clone()) {
            Entry::Occupied(entry) => {
                let class = entry.into_mut();
                // Reconcile: when the mapping folded the request onto a
                // different file, the caller's observed mtime is for the
                // wrong path and the canonical source is stat'ed fresh. A
                // failed stat aborts with the class untouched.
                let fresh_mtime = if canonical.as_path() != requested {
                    match stat_source(&canonical) {
                        Ok(stat) => stat.mtime,
                        Err(source) => {
                            warn!(class = %canonical.display(), "cannot access or stat class source");
                            return Err(PoolError::Stat {
                                path: canonical,
                                source,
                            });
                        }
                    }
                } else {
                    observed_mtime
                };
                if fresh_mtime > class.mtime() {
                    let flagged = class.invalidate(fresh_mtime);
                    self.expired += flagged;
                }
                class
            }
            Entry::Vacant(entry) => {
                let policy = self.config.policy_for(&canonical);
                debug!(class = %canonical.display(), ?policy, "creating interpreter class");
                entry.insert(InterpClass::new(
                    canonical.clone(),
                    observed_mtime,
                    policy,
                ))
            }
        };

        let (found, flagged) = class.find_free(domain, now);
        self.expired += flagged;
        let (id, reused) = match found {
            Some(id) => (id, true),
            None => (
                class.create_instance(engine.as_ref(), domain, observed_mtime)?,
                false,
            ),
        };
        let (context, code) = class
            .reserve(id)
            .expect("selected instance is pooled and free");

        if reused {
            self.reuse_hits += 1;
        } else {
            self.created += 1;
        }
        let live = self.live_instances();
        if live > self.peak_live {
            self.peak_live = live;
        }

        Ok(InterpLease::new(canonical, id, domain, context, code))
    }

    /// Return a lease. Applies the release transitions, destroys the
    /// instance in place if it expired, then sweeps the class.
    pub fn release(&mut self, lease: InterpLease) -> Result<(), PoolError> {
        let (identity, id, domain, context) = lease.into_parts();
        let engine = self.engine.clone();

        match self.classes.get_mut(&identity) {
            Some(class) if class.contains(id) => {
                let report = class.release_instance(id, context, engine.as_ref(), domain);
                debug!(id, class = %identity.display(), state = ?report.state, "instance released");
                if report.expired_by_requests {
                    self.expired += 1;
                }
                if report.destroyed {
                    self.destroyed += 1;
                }
                let (flagged, destroyed) =
                    class.sweep(domain, SystemTime::now(), engine.as_ref());
                self.expired += flagged;
                self.destroyed += destroyed;
                Ok(())
            }
            _ => {
                // The scope was torn down while the lease was out. The
                // caller is the owner, so the engine teardown is safe here.
                warn!(
                    id,
                    class = %identity.display(),
                    "released instance is no longer pooled; destroying context"
                );
                engine.destroy_context(context);
                Err(PoolError::NoSuchInstance { identity, id })
            }
        }
    }

    /// Flag one instance expired. Callable from any domain; a repeat call
    /// (or an unknown instance) reports `false`.
    pub fn mark_expired(&mut self, identity: &Path, id: u64) -> bool {
        let changed = self
            .classes
            .get_mut(identity)
            .map(|class| class.mark_expired(id))
            .unwrap_or(false);
        if changed {
            self.expired += 1;
        }
        changed
    }

    /// Set the policy for an identity, updating the live class and the
    /// stored configuration so later classes inherit it too.
    pub fn configure_class_policy(&mut self, identity: &Path, policy: ClassPolicy) {
        if let Some(class) = self.classes.get_mut(identity) {
            class.set_policy(policy);
        }
        self.config.set_class_policy(identity, policy);
        debug!(class = %identity.display(), ?policy, "class policy configured");
    }

    /// Sweep every class: expire free instances past their budget and
    /// destroy expired instances owned by `domain`.
    pub fn sweep(&mut self, domain: DomainId) {
        let engine = self.engine.clone();
        let now = SystemTime::now();
        for class in self.classes.values_mut() {
            let (flagged, destroyed) = class.sweep(domain, now, engine.as_ref());
            self.expired += flagged;
            self.destroyed += destroyed;
        }
    }

    /// Destroy every class and instance unconditionally; the scope is
    /// ending, so the usual "destroy only when visited by the owner" rule
    /// does not apply. Foreign-owned contexts are still only unlinked.
    pub fn teardown(&mut self, domain: DomainId) {
        info!(classes = self.classes.len(), "tearing down interpreter pool");
        let engine = self.engine.clone();
        for (identity, mut class) in self.classes.drain() {
            let (torn_down, unlinked) = class.destroy_all(engine.as_ref(), domain);
            self.destroyed += torn_down + unlinked;
            if unlinked > 0 {
                warn!(
                    class = %identity.display(),
                    unlinked,
                    "foreign-owned contexts unlinked without engine teardown"
                );
            }
        }
    }

    /// Inspect a cached class.
    pub fn class(&self, identity: &Path) -> Option<&InterpClass> {
        self.classes.get(identity)
    }

    /// Snapshot current registry statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            classes: self.classes.len(),
            live_instances: self.live_instances(),
            reuse_hits: self.reuse_hits,
            created: self.created,
            destroyed: self.destroyed,
            expired: self.expired,
            peak_live: self.peak_live,
        }
    }

    fn live_instances(&self) -> usize {
        self.classes.values().map(InterpClass::len).sum()
    }
}

//! Interpreter Classes - One Cache Entry per Script Identity
//!
//! A class owns every pooled instance for one canonical script path, plus
//! the shared compiled-code cache and the expiration policy that governs
//! them. Instances are kept most-recently-created-first and selected by a
//! plain first-fit scan; which instance accumulates requests fastest
//! depends on that order, so it is load-bearing behavior, not an
//! optimization target.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::engine::{CodeArtifact, ScriptContext, ScriptEngine};
use crate::error::PoolError;
use crate::pool::instance::{Interp, InterpState};
use crate::pool::policy::ClassPolicy;
use crate::pool::DomainId;

/// What happened when an instance came back from a lease.
pub(crate) struct ReleaseReport {
    pub state: InterpState,
    /// The release itself pushed the instance over its request budget.
    pub expired_by_requests: bool,
    /// The instance was destroyed in place (caller is the owning domain).
    pub destroyed: bool,
}

/// Cache entry for one script identity.
pub struct InterpClass {
    identity: PathBuf,
    mtime: SystemTime,
    policy: ClassPolicy,
    next_id: u64,
    code: Option<Arc<CodeArtifact>>,
    /// Front = most recently created.
    interps: VecDeque<Interp>,
}

impl InterpClass {
    pub(crate) fn new(identity: PathBuf, mtime: SystemTime, policy: ClassPolicy) -> Self {
        Self {
            identity,
            mtime,
            policy,
            next_id: 0,
            code: None,
            interps: VecDeque::new(),
        }
    }

    pub fn identity(&self) -> &Path {
        &self.identity
    }

    /// Last known modification time of the class source.
    pub fn mtime(&self) -> SystemTime {
        self.mtime
    }

    pub fn policy(&self) -> ClassPolicy {
        self.policy
    }

    pub(crate) fn set_policy(&mut self, policy: ClassPolicy) {
        self.policy = policy;
    }

    /// The shared compiled-code cache, if populated.
    pub fn cached_code(&self) -> Option<&Arc<CodeArtifact>> {
        self.code.as_ref()
    }

    /// Number of pooled instances, in any state.
    pub fn len(&self) -> usize {
        self.interps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interps.is_empty()
    }

    /// Iterate pooled instances, most recently created first.
    pub fn instances(&self) -> impl Iterator<Item = &Interp> {
        self.interps.iter()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.interps.iter().any(|i| i.id() == id)
    }

    /// First-fit scan for a free instance owned by `domain`.
    ///
    /// Free instances that have outlived their idle/ttl budget are flagged
    /// expired along the way (destruction waits for the next sweep).
    /// Returns the chosen id and how many instances were flagged.
    pub(crate) fn find_free(&mut self, domain: DomainId, now: SystemTime) -> (Option<u64>, u64) {
        let mut flagged = 0;
        for interp in self.interps.iter_mut() {
            if interp.owner() != domain {
                continue;
            }
            if let Some(reason) = interp.sweep_reason(now, &self.policy) {
                interp.mark_expired();
                flagged += 1;
                info!(
                    id = interp.id(),
                    class = %self.identity.display(),
                    "interpreter expired: {reason}"
                );
                continue;
            }
            if interp.is_free() {
                return (Some(interp.id()), flagged);
            }
        }
        (None, flagged)
    }

    /// Create a fresh instance at the front of the list.
    ///
    /// Loads code on demand when the class has none cached and promotes a
    /// successful load into the class along with the observed mtime. A
    /// failed load is logged and the instance pooled without code, so the
    /// caller's execution attempt fails predictably instead of the
    /// acquisition.
    pub(crate) fn create_instance(
        &mut self,
        engine: &dyn ScriptEngine,
        domain: DomainId,
        observed_mtime: SystemTime,
    ) -> Result<u64, PoolError> {
        let mut context = engine.create_context().map_err(|source| {
            warn!(class = %self.identity.display(), "could not create interpreter context");
            PoolError::Creation {
                identity: self.identity.clone(),
                source,
            }
        })?;

        if let Err(source) = engine.one_time_setup(context.as_mut()) {
            engine.destroy_context(context);
            return Err(PoolError::Creation {
                identity: self.identity.clone(),
                source,
            });
        }

        let code = match &self.code {
            Some(artifact) => Some(artifact.clone()),
            None => match engine.load_code(context.as_mut(), &self.identity) {
                Ok(artifact) => {
                    let artifact = Arc::new(artifact);
                    self.code = Some(artifact.clone());
                    self.mtime = observed_mtime;
                    Some(artifact)
                }
                Err(err) => {
                    warn!(
                        id = self.next_id,
                        class = %self.identity.display(),
                        error = %err,
                        "could not load script code"
                    );
                    None
                }
            },
        };

        let id = self.next_id;
        self.next_id += 1;
        self.interps
            .push_front(Interp::new(id, domain, context, code));
        debug!(
            id,
            class = %self.identity.display(),
            owner = domain.raw(),
            "created interpreter instance"
        );
        Ok(id)
    }

    /// Check out the context of the instance chosen by `find_free` or
    /// `create_instance`.
    pub(crate) fn reserve(
        &mut self,
        id: u64,
    ) -> Option<(Box<dyn ScriptContext>, Option<Arc<CodeArtifact>>)> {
        let interp = self.interps.iter_mut().find(|i| i.id() == id)?;
        Some(interp.reserve())
    }

    /// Return a leased context and apply the release transitions.
    ///
    /// An instance that ends up `Expired` is destroyed immediately: the
    /// releasing caller is, by construction, the owning domain.
    pub(crate) fn release_instance(
        &mut self,
        id: u64,
        context: Box<dyn ScriptContext>,
        engine: &dyn ScriptEngine,
        caller: DomainId,
    ) -> ReleaseReport {
        let pos = self
            .interps
            .iter()
            .position(|i| i.id() == id)
            .expect("caller verified the instance is pooled");

        let was_expired_in_use = self.interps[pos].state() == InterpState::ExpiredInUse;
        let state = self.interps[pos].release(context, &self.policy);
        let expired_by_requests = state == InterpState::Expired && !was_expired_in_use;
        if expired_by_requests {
            info!(
                id,
                class = %self.identity.display(),
                "interpreter expired: request count reached"
            );
        }

        let destroyed = if state == InterpState::Expired {
            self.destroy_at(pos, engine, caller)
        } else {
            false
        };

        ReleaseReport {
            state,
            expired_by_requests,
            destroyed,
        }
    }

    /// Flag one instance expired. Legal from any domain.
    pub(crate) fn mark_expired(&mut self, id: u64) -> bool {
        match self.interps.iter_mut().find(|i| i.id() == id) {
            Some(interp) => {
                let changed = interp.mark_expired();
                if changed {
                    debug!(id, class = %self.identity.display(), "instance flagged expired");
                }
                changed
            }
            None => false,
        }
    }

    /// The source changed: flag every instance, drop the cached code, and
    /// record the new mtime. In-flight instances become `ExpiredInUse`, so
    /// nothing is interrupted; the next loader repopulates the cache.
    pub(crate) fn invalidate(&mut self, new_mtime: SystemTime) -> u64 {
        let mut flagged = 0;
        for interp in self.interps.iter_mut() {
            if interp.mark_expired() {
                flagged += 1;
            }
            info!(
                id = interp.id(),
                class = %self.identity.display(),
                "interpreter expired: source changed"
            );
        }
        self.code = None;
        self.mtime = new_mtime;
        flagged
    }

    /// Sweep pass for one domain: flag free instances that outlived their
    /// budget, then destroy expired instances owned by `domain`. Instances
    /// owned by other domains are never touched. Returns (flagged,
    /// destroyed).
    ///
    /// An emptied class stays in the registry: its compiled-code cache
    /// outlives the instances so the next acquire can reuse it.
    pub(crate) fn sweep(
        &mut self,
        domain: DomainId,
        now: SystemTime,
        engine: &dyn ScriptEngine,
    ) -> (u64, u64) {
        let mut flagged = 0;
        let mut destroyed = 0;
        let mut pos = 0;
        while pos < self.interps.len() {
            let destroy = {
                let interp = &mut self.interps[pos];
                if interp.owner() != domain {
                    false
                } else {
                    if let Some(reason) = interp.sweep_reason(now, &self.policy) {
                        interp.mark_expired();
                        flagged += 1;
                        info!(
                            id = interp.id(),
                            class = %self.identity.display(),
                            "interpreter expired: {reason}"
                        );
                    }
                    interp.state() == InterpState::Expired
                }
            };
            if destroy {
                self.destroy_at(pos, engine, domain);
                destroyed += 1;
            } else {
                pos += 1;
            }
        }
        (flagged, destroyed)
    }

    /// Destroy every instance unconditionally; the registry scope is
    /// ending. Returns (engine-destroyed, unlinked-only).
    pub(crate) fn destroy_all(
        &mut self,
        engine: &dyn ScriptEngine,
        caller: DomainId,
    ) -> (u64, u64) {
        let mut torn_down = 0;
        let mut unlinked = 0;
        while !self.interps.is_empty() {
            if self.destroy_at(0, engine, caller) {
                torn_down += 1;
            } else {
                unlinked += 1;
            }
        }
        (torn_down, unlinked)
    }

    #[cfg(test)]
    pub(crate) fn backdate_instance(&mut self, id: u64, idle_secs: u64, age_secs: u64) {
        if let Some(interp) = self.interps.iter_mut().find(|i| i.id() == id) {
            interp.backdate(idle_secs, age_secs);
        }
    }

    /// Unlink the instance at `pos`. The engine-side teardown only happens
    /// when `caller` owns it; a foreign-owned context is unlinked without
    /// teardown and its engine resources are not reclaimed until the owning
    /// domain exits or is recycled. Returns whether the engine hook ran.
    fn destroy_at(&mut self, pos: usize, engine: &dyn ScriptEngine, caller: DomainId) -> bool {
        let mut interp = self
            .interps
            .remove(pos)
            .expect("destroy position is in range");
        if interp.owner() == caller {
            if let Some(context) = interp.take_context() {
                engine.destroy_context(context);
            }
            debug!(
                id = interp.id(),
                class = %self.identity.display(),
                "destroyed interpreter instance"
            );
            true
        } else {
            debug!(
                id = interp.id(),
                class = %self.identity.display(),
                owner = interp.owner().raw(),
                "unlinked foreign-owned instance without engine teardown"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EchoEngine;

    fn class(policy: ClassPolicy) -> InterpClass {
        InterpClass::new(PathBuf::from("/app/s.ws"), SystemTime::now(), policy)
    }

    #[test]
    fn test_create_assigns_monotonic_ids() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let domain = DomainId::new(1);
        let now = SystemTime::now();

        let a = class.create_instance(&engine, domain, now).unwrap();
        let b = class.create_instance(&engine, domain, now).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(class.len(), 2);

        // Most recently created sits at the front.
        let ids: Vec<u64> = class.instances().map(Interp::id).collect();
        assert_eq!(ids, vec![1, 0]);
    }

    #[test]
    fn test_find_free_skips_foreign_domains() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let now = SystemTime::now();

        class.create_instance(&engine, DomainId::new(1), now).unwrap();
        let (found, _) = class.find_free(DomainId::new(2), now);
        assert_eq!(found, None);

        let (found, _) = class.find_free(DomainId::new(1), now);
        assert_eq!(found, Some(0));
    }

    #[test]
    fn test_first_fit_prefers_most_recent() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let domain = DomainId::new(1);
        let now = SystemTime::now();

        class.create_instance(&engine, domain, now).unwrap();
        class.create_instance(&engine, domain, now).unwrap();

        let (found, _) = class.find_free(domain, now);
        assert_eq!(found, Some(1));
    }

    #[test]
    fn test_release_expired_in_use_destroys() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let domain = DomainId::new(1);
        let now = SystemTime::now();

        let id = class.create_instance(&engine, domain, now).unwrap();
        let (ctx, _) = class.reserve(id).unwrap();

        assert!(class.mark_expired(id));
        let report = class.release_instance(id, ctx, &engine, domain);
        assert_eq!(report.state, InterpState::Expired);
        assert!(!report.expired_by_requests);
        assert!(report.destroyed);
        assert!(class.is_empty());
        assert_eq!(engine.contexts_destroyed(), 1);
    }

    #[test]
    fn test_invalidate_flags_and_drops_code() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let domain = DomainId::new(1);
        let now = SystemTime::now();

        let busy = class.create_instance(&engine, domain, now).unwrap();
        let idle = class.create_instance(&engine, domain, now).unwrap();
        let (ctx, _) = class.reserve(busy).unwrap();

        let flagged = class.invalidate(SystemTime::now());
        assert_eq!(flagged, 2);
        assert!(class.cached_code().is_none());

        let states: Vec<(u64, InterpState)> = class
            .instances()
            .map(|i| (i.id(), i.state()))
            .collect();
        assert!(states.contains(&(busy, InterpState::ExpiredInUse)));
        assert!(states.contains(&(idle, InterpState::Expired)));

        // In-flight work finishes, then the instance expires for good.
        let report = class.release_instance(busy, ctx, &engine, domain);
        assert_eq!(report.state, InterpState::Expired);
    }

    #[test]
    fn test_sweep_destroys_only_owned() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let now = SystemTime::now();

        let mine = class.create_instance(&engine, DomainId::new(1), now).unwrap();
        let theirs = class.create_instance(&engine, DomainId::new(2), now).unwrap();
        assert!(class.mark_expired(mine));
        assert!(class.mark_expired(theirs));

        let (_, destroyed) = class.sweep(DomainId::new(1), now, &engine);
        assert_eq!(destroyed, 1);
        assert_eq!(class.len(), 1);
        assert_eq!(class.instances().next().map(Interp::id), Some(theirs));
    }

    #[test]
    fn test_destroy_all_unlinks_foreign() {
        let engine = EchoEngine::new();
        let mut class = class(ClassPolicy::unbounded());
        let now = SystemTime::now();

        class.create_instance(&engine, DomainId::new(1), now).unwrap();
        class.create_instance(&engine, DomainId::new(2), now).unwrap();

        let (torn_down, unlinked) = class.destroy_all(&engine, DomainId::new(1));
        assert_eq!((torn_down, unlinked), (1, 1));
        assert!(class.is_empty());
        // The foreign context never saw its engine teardown hook.
        assert_eq!(engine.contexts_destroyed(), 1);
    }
}

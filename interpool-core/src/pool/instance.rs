//! Instance Lifecycle - Pooled Interpreters and Their State Machine
//!
//! Every pooled execution context moves through four states:
//!
//! ```text
//! (new) ──create+reserve──▶ InUse
//! Free ──reserve──▶ InUse
//! InUse ──release, under threshold──▶ Free
//! InUse ──release, request limit──▶ Expired
//! InUse ──invalidation (any domain)──▶ ExpiredInUse
//! ExpiredInUse ──release──▶ Expired
//! Free ──sweep: idle/ttl, or invalidation──▶ Expired
//! Expired ──destroy (owning domain)──▶ gone
//! ```
//!
//! Expiry is always lazy: flagging never interrupts an execution in
//! flight. Destruction is strictly owner-domain work.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::engine::{CodeArtifact, ScriptContext};
use crate::pool::policy::ClassPolicy;
use crate::pool::DomainId;

/// Lifecycle state of a pooled instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpState {
    /// Pooled and eligible for reservation by its owning domain.
    Free,
    /// Reserved; its context is checked out to a caller.
    InUse,
    /// Stale; destroyed the next time its owning domain visits it.
    Expired,
    /// Stale but still executing; becomes `Expired` on release.
    ExpiredInUse,
}

/// One pooled execution context plus its bookkeeping.
///
/// Owned exclusively by its class; the `owner` domain is fixed at creation
/// and is the only domain allowed to execute against or destroy it. Any
/// domain may flag it expired (a metadata-only mutation).
pub struct Interp {
    id: u64,
    state: InterpState,
    owner: DomainId,
    created_at: SystemTime,
    last_used_at: SystemTime,
    request_count: u64,
    /// `None` while the context is checked out through a lease.
    context: Option<Box<dyn ScriptContext>>,
    code: Option<Arc<CodeArtifact>>,
}

impl Interp {
    pub(crate) fn new(
        id: u64,
        owner: DomainId,
        context: Box<dyn ScriptContext>,
        code: Option<Arc<CodeArtifact>>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            state: InterpState::Free,
            owner,
            created_at: now,
            last_used_at: now,
            request_count: 0,
            context: Some(context),
            code,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> InterpState {
        self.state
    }

    pub fn owner(&self) -> DomainId {
        self.owner
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_used_at(&self) -> SystemTime {
        self.last_used_at
    }

    pub(crate) fn is_free(&self) -> bool {
        self.state == InterpState::Free
    }

    /// Check the context out for execution. Caller has verified `Free`.
    pub(crate) fn reserve(&mut self) -> (Box<dyn ScriptContext>, Option<Arc<CodeArtifact>>) {
        self.state = InterpState::InUse;
        let context = self
            .context
            .take()
            .expect("free instance always holds its context");
        (context, self.code.clone())
    }

    /// Return the context and apply the release transitions.
    pub(crate) fn release(
        &mut self,
        context: Box<dyn ScriptContext>,
        policy: &ClassPolicy,
    ) -> InterpState {
        self.context = Some(context);
        self.last_used_at = SystemTime::now();
        self.request_count += 1;
        self.state = match self.state {
            InterpState::ExpiredInUse => InterpState::Expired,
            _ => {
                if policy.request_limit_reached(self.request_count) {
                    InterpState::Expired
                } else {
                    InterpState::Free
                }
            }
        };
        self.state
    }

    /// Flag stale. Legal from any domain; narrows future eligibility and
    /// never triggers resource release. Returns whether anything changed,
    /// so a second call on the same instance is a visible no-op.
    pub(crate) fn mark_expired(&mut self) -> bool {
        match self.state {
            InterpState::Free => {
                self.state = InterpState::Expired;
                true
            }
            InterpState::InUse => {
                self.state = InterpState::ExpiredInUse;
                true
            }
            InterpState::Expired | InterpState::ExpiredInUse => false,
        }
    }

    /// Expiry reason when a free instance has outlived its policy.
    pub(crate) fn sweep_reason(
        &self,
        now: SystemTime,
        policy: &ClassPolicy,
    ) -> Option<&'static str> {
        if self.state != InterpState::Free {
            return None;
        }
        if policy.idle_exceeded(self.last_used_at, now) {
            return Some("idle time reached");
        }
        if policy.ttl_exceeded(self.created_at, now) {
            return Some("time to live reached");
        }
        None
    }

    /// Take the context for teardown, if it is not checked out.
    pub(crate) fn take_context(&mut self) -> Option<Box<dyn ScriptContext>> {
        self.context.take()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, idle_secs: u64, age_secs: u64) {
        use std::time::Duration;
        self.last_used_at = SystemTime::now() - Duration::from_secs(idle_secs);
        self.created_at = SystemTime::now() - Duration::from_secs(age_secs);
    }
}

/// A reserved instance, checked out to one caller.
///
/// The lease carries the execution context itself, so callers run scripts
/// without holding any pool lock. It is intentionally neither `Send` nor
/// `Sync`: execution contexts never cross concurrency domains, and keeping
/// the lease domain-bound enforces that statically. Return it with
/// `release` exactly once.
pub struct InterpLease {
    identity: PathBuf,
    id: u64,
    domain: DomainId,
    context: Box<dyn ScriptContext>,
    code: Option<Arc<CodeArtifact>>,
    _not_send: PhantomData<*const ()>,
}

impl InterpLease {
    pub(crate) fn new(
        identity: PathBuf,
        id: u64,
        domain: DomainId,
        context: Box<dyn ScriptContext>,
        code: Option<Arc<CodeArtifact>>,
    ) -> Self {
        Self {
            identity,
            id,
            domain,
            context,
            code,
            _not_send: PhantomData,
        }
    }

    /// Canonical identity of the class this instance belongs to.
    pub fn identity(&self) -> &Path {
        &self.identity
    }

    /// Instance id, unique within the class.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Domain that owns the underlying context.
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// The code to execute, if the class had (or could load) any.
    pub fn code(&self) -> Option<&Arc<CodeArtifact>> {
        self.code.as_ref()
    }

    /// Mutable access to the execution context for the caller's engine.
    pub fn context_mut(&mut self) -> &mut dyn ScriptContext {
        self.context.as_mut()
    }

    pub(crate) fn into_parts(self) -> (PathBuf, u64, DomainId, Box<dyn ScriptContext>) {
        (self.identity, self.id, self.domain, self.context)
    }
}

impl std::fmt::Debug for InterpLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpLease")
            .field("identity", &self.identity)
            .field("id", &self.id)
            .field("domain", &self.domain)
            .field("has_code", &self.code.is_some())
            .finish_non_exhaustive()
    }
}

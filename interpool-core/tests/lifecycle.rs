//! End-to-end lifecycle coverage for the interpreter pool.
//!
//! These tests drive the public surface the way a serving host would:
//! resolve, acquire, execute, release, and let the policies expire and
//! reload instances underneath.

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use interpool_core::{
    stat_source, ClassPolicy, CodeArtifact, DomainId, EchoEngine, InterpPool, InterpState,
    PoolError, ScriptContext, ScriptEngine, ScriptedResolver, SharedInterpPool,
};

/// Engine whose "compiler" fabricates code in memory, so tests can run
/// without script files on disk.
struct MemoryEngine {
    created: AtomicU64,
    destroyed: AtomicU64,
}

struct MemoryContext {
    ready: bool,
}

impl ScriptContext for MemoryContext {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

impl MemoryEngine {
    fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl ScriptEngine for MemoryEngine {
    fn engine_type(&self) -> &str {
        "memory"
    }

    fn create_context(&self) -> Result<Box<dyn ScriptContext>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryContext { ready: false }))
    }

    fn one_time_setup(&self, context: &mut dyn ScriptContext) -> Result<()> {
        if let Some(ctx) = context.as_any().downcast_mut::<MemoryContext>() {
            ctx.ready = true;
        }
        Ok(())
    }

    fn load_code(&self, _context: &mut dyn ScriptContext, path: &Path) -> Result<CodeArtifact> {
        Ok(CodeArtifact::new(
            path,
            format!("code for {}", path.display()).into_bytes(),
        ))
    }

    fn eval(&self, context: &mut dyn ScriptContext, code: &CodeArtifact) -> Result<String> {
        match context.as_any().downcast_mut::<MemoryContext>() {
            Some(ctx) if ctx.ready => Ok(String::from_utf8_lossy(code.bytes()).into_owned()),
            _ => anyhow::bail!("context not prepared"),
        }
    }

    fn destroy_context(&self, context: Box<dyn ScriptContext>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        drop(context);
    }
}

fn memory_pool(engine: Arc<MemoryEngine>) -> InterpPool {
    InterpPool::new(engine, Arc::new(ScriptedResolver::identity()))
}

/// Scenario A: with `max_requests = 3`, the third release expires the
/// instance and the fourth acquire gets a brand-new one.
#[test]
fn request_budget_recycles_instances() {
    let engine = Arc::new(MemoryEngine::new());
    let mut pool = memory_pool(engine.clone());
    let domain = DomainId::new(1);
    let mtime = SystemTime::now();
    pool.configure_class_policy(
        Path::new("/s.ws"),
        ClassPolicy {
            max_requests: 3,
            max_idle_secs: 0,
            max_ttl_secs: 0,
        },
    );

    for _ in 0..3 {
        let lease = pool.acquire(domain, Path::new("/s.ws"), mtime).unwrap();
        assert_eq!(lease.id(), 0);
        pool.release(lease).unwrap();
    }

    // Third release crossed the budget: the instance is gone.
    assert_eq!(engine.destroyed(), 1);
    assert!(pool.class(Path::new("/s.ws")).unwrap().is_empty());

    let lease = pool.acquire(domain, Path::new("/s.ws"), mtime).unwrap();
    assert_eq!(lease.id(), 1);
    assert_eq!(engine.created(), 2);
    pool.release(lease).unwrap();
}

/// Scenario B: a newer source mtime clears the cached code, expires free
/// instances, and lets in-flight ones finish on the old artifact.
#[test]
fn source_change_invalidates_without_interrupting() {
    let engine = Arc::new(MemoryEngine::new());
    let mut pool = memory_pool(engine.clone());
    let domain = DomainId::new(1);
    let script = Path::new("/s.ws");
    let old = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
    let new = SystemTime::UNIX_EPOCH + Duration::from_secs(150);
    pool.configure_class_policy(script, ClassPolicy::unbounded());

    let in_flight = pool.acquire(domain, script, old).unwrap();
    let idle = pool.acquire(domain, script, old).unwrap();
    let old_code = in_flight.code().unwrap().clone();
    // Both instances share the class's cached artifact.
    assert!(Arc::ptr_eq(&old_code, idle.code().unwrap()));
    let idle_id = idle.id();
    pool.release(idle).unwrap();

    // The source changed under us.
    let fresh = pool.acquire(domain, script, new).unwrap();
    let new_code = fresh.code().unwrap().clone();
    assert!(!Arc::ptr_eq(&old_code, &new_code));

    {
        let class = pool.class(script).unwrap();
        let state_of = |id: u64| {
            class
                .instances()
                .find(|i| i.id() == id)
                .map(|i| i.state())
        };
        assert_eq!(state_of(in_flight.id()), Some(InterpState::ExpiredInUse));
        assert_eq!(state_of(idle_id), Some(InterpState::Expired));
        // The class promoted the fresh artifact.
        assert!(Arc::ptr_eq(class.cached_code().unwrap(), &new_code));
    }

    // The in-flight execution still holds the old artifact and finishes
    // undisturbed; its release retires the instance for good.
    assert!(Arc::ptr_eq(in_flight.code().unwrap(), &old_code));
    pool.release(in_flight).unwrap();
    pool.release(fresh).unwrap();
    pool.sweep(domain);

    let class = pool.class(script).unwrap();
    assert_eq!(class.len(), 1);
    assert!(class.instances().all(|i| i.state() == InterpState::Free));
}

/// Scenario D: two domains sharing one registry never share an instance.
#[test]
fn shared_registry_keeps_domains_apart() {
    let engine = Arc::new(MemoryEngine::new());
    let pool = SharedInterpPool::new(engine.clone(), Arc::new(ScriptedResolver::identity()));
    pool.configure_class_policy(Path::new("/s.ws"), ClassPolicy::unbounded());
    let mtime = SystemTime::now();
    let a = DomainId::new(1);
    let b = DomainId::new(2);

    let lease_a = pool.acquire(a, Path::new("/s.ws"), mtime).unwrap();
    let lease_b = pool.acquire(b, Path::new("/s.ws"), mtime).unwrap();
    assert_ne!(lease_a.id(), lease_b.id());
    pool.release(lease_a).unwrap();
    pool.release(lease_b).unwrap();

    // Each domain reuses its own instance afterwards.
    let again_a = pool.acquire(a, Path::new("/s.ws"), mtime).unwrap();
    let again_b = pool.acquire(b, Path::new("/s.ws"), mtime).unwrap();
    assert_eq!(engine.created(), 2);
    assert_eq!(pool.stats().reuse_hits, 2);
    pool.release(again_a).unwrap();
    pool.release(again_b).unwrap();
}

/// Scenario E: a mapping failure aborts only the failing request; the
/// cached class keeps serving other requests.
#[test]
fn mapping_failure_is_isolated() {
    let engine = Arc::new(MemoryEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let controller = dir.path().join("main.ws");
    std::fs::write(&controller, "controller").unwrap();

    // Every request folds onto one controller script; paths containing
    // "broken" make the mapping program itself fail.
    let fold_to = controller.clone();
    let resolver = ScriptedResolver::with_program(move |requested| {
        if requested.to_string_lossy().contains("broken") {
            anyhow::bail!("interpmap script error");
        }
        Ok(fold_to.clone())
    });
    let mut pool = InterpPool::new(engine, Arc::new(resolver));
    pool.configure_class_policy(&controller, ClassPolicy::unbounded());
    let domain = DomainId::new(1);
    let mtime = stat_source(&controller).unwrap().mtime;

    let lease = pool.acquire(domain, Path::new("/good.ws"), mtime).unwrap();
    pool.release(lease).unwrap();
    let before = pool.stats();

    let err = pool
        .acquire(domain, Path::new("/broken.ws"), mtime)
        .unwrap_err();
    assert!(matches!(err, PoolError::Mapping { .. }));
    assert_eq!(pool.stats(), before);

    // A different, valid request path folds onto the same healthy class.
    let lease = pool.acquire(domain, Path::new("/good2.ws"), mtime).unwrap();
    assert_eq!(pool.stats().reuse_hits, before.reuse_hits + 1);
    pool.release(lease).unwrap();
}

/// Executing through the pool with a real file on disk, including a reload
/// after the file changes.
#[test]
fn serves_and_reloads_a_real_script() {
    let engine = Arc::new(EchoEngine::new());
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("page.ws");
    std::fs::write(&script, "first version").unwrap();

    let mut pool = InterpPool::new(engine.clone(), Arc::new(ScriptedResolver::identity()));
    pool.configure_class_policy(&script, ClassPolicy::unbounded());
    let domain = DomainId::new(1);

    let observed = stat_source(&script).unwrap();
    let mut lease = pool.acquire(domain, &script, observed.mtime).unwrap();
    let code = lease.code().unwrap().clone();
    let output = engine.eval(lease.context_mut(), &code).unwrap();
    assert_eq!(output, "first version");
    pool.release(lease).unwrap();

    // Rewrite the script and push its mtime clearly forward.
    std::fs::write(&script, "second version").unwrap();
    let file = std::fs::OpenOptions::new().write(true).open(&script).unwrap();
    file.set_modified(observed.mtime + Duration::from_secs(10))
        .unwrap();
    drop(file);

    let observed = stat_source(&script).unwrap();
    let mut lease = pool.acquire(domain, &script, observed.mtime).unwrap();
    let code = lease.code().unwrap().clone();
    let output = engine.eval(lease.context_mut(), &code).unwrap();
    assert_eq!(output, "second version");
    pool.release(lease).unwrap();

    // The stale instance was expired by the reload and swept.
    assert_eq!(engine.contexts_created(), 2);
    pool.teardown(domain);
    assert_eq!(engine.contexts_destroyed(), 2);
}

/// A caller that hits an execution error flags the instance out of
/// caution; the pool retires it on release.
#[test]
fn caller_expires_suspect_instance() {
    let engine = Arc::new(MemoryEngine::new());
    let mut pool = memory_pool(engine.clone());
    pool.configure_class_policy(Path::new("/s.ws"), ClassPolicy::unbounded());
    let domain = DomainId::new(1);
    let mtime = SystemTime::now();

    let lease = pool.acquire(domain, Path::new("/s.ws"), mtime).unwrap();
    let (identity, id) = (lease.identity().to_path_buf(), lease.id());

    // Pretend the script blew up mid-request.
    assert!(pool.mark_expired(&identity, id));
    pool.release(lease).unwrap();
    assert_eq!(engine.destroyed(), 1);

    let lease = pool.acquire(domain, Path::new("/s.ws"), mtime).unwrap();
    assert_eq!(lease.id(), id + 1);
    pool.release(lease).unwrap();
}

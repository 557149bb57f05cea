//! Script Engine Interface - Language-Agnostic Execution Contexts
//!
//! The pool never interprets scripts itself. It manages opaque execution
//! contexts provided by a [`ScriptEngine`], which wraps whatever embedded
//! language the host server ships. Contexts are expensive to create (engine
//! init, built-in hardening, code loading), which is the whole reason the
//! pool exists.
//!
//! # Contract:
//! - Contexts are bound to the concurrency domain that created them; the
//!   pool guarantees [`ScriptEngine::destroy_context`] and evaluation only
//!   ever happen from that domain.
//! - [`CodeArtifact`]s are immutable once materialized and are shared
//!   reference-counted between a class and its instances.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use tracing::debug;

/// One opaque execution context.
///
/// Engines downcast through [`as_any`](Self::as_any) to reach their own
/// state. `Send` is required so a context can sit in a shared registry while
/// free; *operating* on it is still only legal from its owning domain.
pub trait ScriptContext: Send {
    fn as_any(&mut self) -> &mut dyn Any;
}

/// A compiled (or otherwise materialized) script, immutable once built.
///
/// The pool shares one artifact between a class and all instances created
/// while it is cached, via `Arc<CodeArtifact>`. Invalidation replaces the
/// whole artifact; it is never mutated in place, so in-flight executions
/// keep a valid reference until they release it.
pub struct CodeArtifact {
    path: PathBuf,
    bytes: Box<[u8]>,
}

impl CodeArtifact {
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// Source path this artifact was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Lifecycle hooks every embeddable engine must provide.
///
/// All hooks are synchronous, blocking calls; the pool performs no internal
/// scheduling. Hook failures are reported as `anyhow::Error` and translated
/// into the pool's typed error surface at the call site.
pub trait ScriptEngine: Send + Sync {
    /// Engine type identifier, e.g. `"echo"`.
    fn engine_type(&self) -> &str;

    /// Allocate a fresh execution context.
    fn create_context(&self) -> Result<Box<dyn ScriptContext>>;

    /// One-time hardening of a fresh context: rename or guard dangerous
    /// built-ins, register callback hooks. Runs exactly once per context,
    /// before any code is loaded into it.
    fn one_time_setup(&self, context: &mut dyn ScriptContext) -> Result<()>;

    /// Compile/materialize the script at `path` into an artifact.
    fn load_code(&self, context: &mut dyn ScriptContext, path: &Path) -> Result<CodeArtifact>;

    /// Run an artifact inside a context. Callers invoke this themselves
    /// while holding a lease; the pool never evaluates code.
    fn eval(&self, context: &mut dyn ScriptContext, code: &CodeArtifact) -> Result<String>;

    /// Tear down a context and release its engine-side resources.
    fn destroy_context(&self, context: Box<dyn ScriptContext>);
}

/// Context state for [`EchoEngine`].
struct EchoContext {
    hardened: bool,
    evals: u64,
}

impl ScriptContext for EchoContext {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// Reference engine that "evaluates" a script by echoing its source text.
///
/// Useful as a stand-in wherever a real language engine would be plugged
/// in, and for exercising the pool: it counts context creations and
/// teardowns so lifecycle behavior is observable.
pub struct EchoEngine {
    created: AtomicU64,
    destroyed: AtomicU64,
}

impl EchoEngine {
    pub fn new() -> Self {
        Self {
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
        }
    }

    /// Number of contexts handed out so far.
    pub fn contexts_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of contexts torn down so far.
    pub fn contexts_destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }
}

impl Default for EchoEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptEngine for EchoEngine {
    fn engine_type(&self) -> &str {
        "echo"
    }

    fn create_context(&self) -> Result<Box<dyn ScriptContext>> {
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(EchoContext {
            hardened: false,
            evals: 0,
        }))
    }

    fn one_time_setup(&self, context: &mut dyn ScriptContext) -> Result<()> {
        let ctx = downcast(context)?;
        // Stands in for renaming `exit` and friends in a real engine.
        ctx.hardened = true;
        Ok(())
    }

    fn load_code(&self, _context: &mut dyn ScriptContext, path: &Path) -> Result<CodeArtifact> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("couldn't read file '{}'", path.display()))?;
        Ok(CodeArtifact::new(path, bytes))
    }

    fn eval(&self, context: &mut dyn ScriptContext, code: &CodeArtifact) -> Result<String> {
        let ctx = downcast(context)?;
        if !ctx.hardened {
            bail!("context evaluated before one-time setup");
        }
        ctx.evals += 1;
        Ok(String::from_utf8_lossy(code.bytes()).into_owned())
    }

    fn destroy_context(&self, context: Box<dyn ScriptContext>) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        drop(context);
    }
}

fn downcast(context: &mut dyn ScriptContext) -> Result<&mut EchoContext> {
    match context.as_any().downcast_mut::<EchoContext>() {
        Some(ctx) => Ok(ctx),
        None => bail!("echo engine was handed a foreign context"),
    }
}

/// Registry of available engines, keyed by engine type.
///
/// Hosts typically register their built-in engine here and let
/// [`EnginePlugins`](crate::plugin::EnginePlugins) add dynamically loaded
/// ones.
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn ScriptEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    /// Register an engine under the given type name.
    pub fn register(&mut self, name: String, engine: Arc<dyn ScriptEngine>) {
        debug!(engine = %name, "registering script engine");
        self.engines.insert(name, engine);
    }

    /// Look up an engine by type name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn ScriptEngine>> {
        self.engines.get(name).cloned()
    }

    /// List all registered engine type names.
    pub fn list_types(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//! Interpool Core - Interpreter Pool Manager for Script-Serving Hosts
//!
//! This crate amortizes the cost of expensive script execution contexts
//! across many short-lived serving requests. Contexts are cached per script
//! identity, bounded by request-count/idle/ttl policies, invalidated when
//! the source changes, and confined to the concurrency domain that created
//! them.
//!
//! The serving layer drives the pool; the scripting language itself plugs
//! in behind the [`ScriptEngine`] trait, statically or via shared-library
//! plugins.

pub mod engine;
pub mod error;
pub mod mapping;
pub mod plugin;
pub mod pool;
pub mod source;

pub use engine::{CodeArtifact, EchoEngine, EngineRegistry, ScriptContext, ScriptEngine};
pub use error::PoolError;
pub use mapping::{IdentityResolver, ScriptedResolver};
pub use plugin::{EngineDescriptor, EnginePlugins};
pub use pool::{
    ClassPolicy, DomainId, InterpClass, InterpLease, InterpPool, InterpState, PoolConfig,
    PoolStats, SharedInterpPool,
};
pub use source::{stat_source, SourceStat};

use anyhow::Result;
use tracing::info;

/// Initialize the process-wide tracing subscriber.
///
/// Respects `RUST_LOG`; defaults to `info`.
pub fn init() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;

    info!("interpool core v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(init().is_ok());
    }
}

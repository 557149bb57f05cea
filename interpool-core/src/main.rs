//! interpool - Run a Script Once Through the Interpreter Pool
//!
//! Small driver around the pool for smoke-testing deployments: resolves,
//! acquires, evaluates, and releases exactly like a serving host would for
//! one request.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use interpool_core::{
    stat_source, DomainId, EchoEngine, EngineRegistry, EnginePlugins, ScriptEngine,
    ScriptedResolver, SharedInterpPool,
};
use tracing::info;

fn print_help() {
    println!(
        "interpool - interpreter pool manager v{}",
        env!("CARGO_PKG_VERSION")
    );
    println!();
    println!("USAGE:");
    println!("  interpool [OPTIONS] [SCRIPT]");
    println!();
    println!("ARGS:");
    println!("  SCRIPT           Script file to evaluate once through the pool");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help       Print this help message");
    println!("  -v, --version    Print version information");
    println!();
    println!("DESCRIPTION:");
    println!("  Interpool caches script execution contexts per script identity and");
    println!("  bounds their lifetime by request, idle, and ttl policies. With a");
    println!("  SCRIPT argument it performs one acquire/eval/release cycle using the");
    println!("  built-in echo engine.");
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut script: Option<PathBuf> = None;

    for arg in &args[1..] {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(());
            }
            "-v" | "--version" => {
                println!("interpool {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            _ if arg.starts_with('-') => {
                eprintln!("error: unrecognized argument '{}'", arg);
                eprintln!("Run 'interpool --help' for usage information.");
                std::process::exit(1);
            }
            _ => script = Some(PathBuf::from(arg)),
        }
    }

    interpool_core::init()?;

    match script {
        Some(path) => run_once(&path),
        None => {
            info!("no script given; pool is idle");
            info!("Run 'interpool --help' for usage information");
            Ok(())
        }
    }
}

/// One full request cycle against a shared pool.
fn run_once(path: &Path) -> Result<()> {
    let engine = Arc::new(EchoEngine::new());

    let mut registry = EngineRegistry::new();
    registry.register(
        engine.engine_type().to_string(),
        engine.clone() as Arc<dyn ScriptEngine>,
    );
    let mut plugins = EnginePlugins::new();
    let loaded = plugins.discover(&mut registry)?;
    info!(builtin = "echo", plugins = loaded.len(), "engines available");

    let resolver = Arc::new(ScriptedResolver::identity());
    let pool = SharedInterpPool::new(engine.clone(), resolver);
    let domain = DomainId::current_thread();

    let observed = stat_source(path)?;
    let mut lease = pool.acquire(domain, path, observed.mtime)?;

    let output = match lease.code() {
        Some(code) => {
            let code = code.clone();
            engine.eval(lease.context_mut(), &code)?
        }
        None => bail!("no code could be loaded for '{}'", path.display()),
    };
    print!("{output}");

    pool.release(lease)?;
    pool.teardown(domain);
    Ok(())
}

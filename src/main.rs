use anyhow::{Result, bail};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use stemforge::EngineConfig;
use stemforge::core::lifecycle::LifecycleManager;
use stemforge::core::orchestrator::{Orchestrator, OrchestratorComponent, schedule_retention_sweep};
use stemforge::core::pool::WorkerPool;
use stemforge::core::separator::CommandSeparator;
use stemforge::core::store::TaskStore;
use stemforge::logging;

const DEFAULT_CONFIG: &str = "stemforge.toml";

struct DaemonArgs {
    config: PathBuf,
}

fn parse_args(args: &[String]) -> Result<Option<DaemonArgs>> {
    let mut config = PathBuf::from(DEFAULT_CONFIG);
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                let Some(path) = args.get(i + 1) else {
                    bail!("--config needs a path");
                };
                config = PathBuf::from(path);
                i += 1;
            }
            "--help" | "-h" => return Ok(None),
            other => bail!("unknown argument: {}", other),
        }
        i += 1;
    }
    Ok(Some(DaemonArgs { config }))
}

fn print_usage() {
    println!("Usage: stemforge [--config <path>]");
    println!();
    println!("Runs the separation task engine until interrupted.");
    println!("Defaults to ./{DEFAULT_CONFIG}; a missing file means built-in defaults.");
}

async fn run(args: DaemonArgs) -> Result<()> {
    let config = Arc::new(EngineConfig::load(&args.config)?);
    logging::init(&config.logging)?;
    info!("Starting stemforge engine...");

    let store = Arc::new(TaskStore::open(&config.database.path)?);
    let pool = Arc::new(WorkerPool::from_config(&config.workers, &config.models)?);
    let separator = Arc::new(CommandSeparator::from_config(&config.separator));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config),
        store,
        pool,
        separator,
    ));

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(OrchestratorComponent::new(
        Arc::clone(&orchestrator),
    ))));
    schedule_retention_sweep(&mut lifecycle, Arc::clone(&orchestrator)).await?;
    lifecycle.start().await?;

    info!(
        "Engine ready: {} workers on {:?}",
        orchestrator.pool().max_workers(),
        orchestrator.pool().devices()
    );

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");
    lifecycle.shutdown().await?;
    info!("Goodbye");
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let parsed = match parse_args(&args) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => {
            print_usage();
            return;
        }
        Err(e) => {
            eprintln!("{e}");
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = run(parsed).await {
        error!("{:#}", e);
        eprintln!("stemforge: {e:#}");
        std::process::exit(1);
    }
}

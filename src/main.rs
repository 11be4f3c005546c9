use anyhow::Context;
use brokermr::broker::BrokerFactory;
use brokermr::computation::BUILTIN;
use brokermr::config::{BrokerBackend, BrokerMrConfig};
use brokermr::coordinator::Coordinator;
use brokermr::worker::{Worker, WorkerPool};
use brokermr::MapReduceError;
use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

/// Map/reduce over a message broker
#[derive(Parser)]
#[command(name = "brokermr")]
#[command(about = "Single-stage map/reduce over a message broker with competing workers", long_about = None)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Path to configuration file (default: ./brokermr.toml when present)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered computations
    List,
    /// Serve partition requests of one computation until interrupted
    Worker {
        /// Registered computation to serve
        #[arg(long)]
        computation: String,

        /// Number of worker processes to start
        #[arg(short = 'w', long, default_value = "1")]
        workers: usize,

        /// Index of this worker, used in logs
        #[arg(long, default_value = "0")]
        index: usize,
    },
    /// Run a computation on its default dataset and print the result as JSON
    Run {
        /// Registered computation to run
        #[arg(long)]
        computation: String,

        /// Worker count used for partitioning (overrides coordinator.workers)
        #[arg(long)]
        workers: Option<u32>,

        /// Declared dataset length, for sources that cannot count themselves
        #[arg(long)]
        length: Option<u64>,

        /// Start N in-process workers first (implied with the memory broker)
        #[arg(long)]
        local: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,redis=debug,sqlx=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("brokermr started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Commands::List => list_computations(),
        Commands::Worker {
            computation,
            workers,
            index,
        } => {
            run_worker(
                cli.config.as_deref(),
                cli.verbose,
                &computation,
                workers,
                index,
            )
            .await
        }
        Commands::Run {
            computation,
            workers,
            length,
            local,
        } => run_computation(cli.config.as_deref(), &computation, workers, length, local).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        let exit_code = match e.downcast_ref::<MapReduceError>() {
            Some(err) => {
                eprintln!("Error: {}", err.user_message());
                err.exit_code()
            }
            None => {
                eprintln!("Error: {e:#}");
                1
            }
        };
        std::process::exit(exit_code);
    }
}

fn list_computations() -> anyhow::Result<()> {
    println!("Registered computations:");
    for entry in BUILTIN.iter() {
        println!(
            "  {} ({}) - {}",
            entry.name(),
            entry.computation.routing_key(),
            entry.description
        );
    }
    Ok(())
}

async fn run_worker(
    config_path: Option<&Path>,
    verbose: u8,
    computation: &str,
    workers: usize,
    index: usize,
) -> anyhow::Result<()> {
    let config = BrokerMrConfig::load(config_path)?;
    let entry = BUILTIN.get(computation)?;

    if config.broker.backend == BrokerBackend::Memory {
        warn!("The memory broker is private to this process; no coordinator can reach it");
    }
    if workers > 1 {
        return spawn_worker_processes(config_path, verbose, computation, workers).await;
    }

    let broker = BrokerFactory::from_config(&config.broker)
        .await
        .map_err(MapReduceError::from)?;
    let worker = Worker::new(Arc::clone(&entry.computation), broker, config.worker.clone())
        .with_id(format!("worker-{}", index));

    let stats = worker
        .listen_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!(
        replied = stats.replied,
        released = stats.released,
        quarantined = stats.quarantined,
        orphaned = stats.orphaned,
        "Worker stopped"
    );
    Ok(())
}

/// Start `count` copies of this executable, each running one worker
async fn spawn_worker_processes(
    config_path: Option<&Path>,
    verbose: u8,
    computation: &str,
    count: usize,
) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("Failed to locate the brokermr executable")?;

    let mut children = Vec::with_capacity(count);
    for index in 0..count {
        let mut command = tokio::process::Command::new(&exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        if verbose > 0 {
            command.arg(format!("-{}", "v".repeat(verbose as usize)));
        }
        command
            .args(["worker", "--computation", computation, "--index"])
            .arg(index.to_string())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker process {}", index))?;
        children.push(child);
    }
    info!(count, computation, "Spawned worker processes");

    // Children share the terminal's process group and receive ctrl-c themselves
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted, waiting for workers to stop"),
        _ = join_all(children.iter_mut().map(|child| child.wait())) => {}
    }

    let statuses = join_all(children.iter_mut().map(|child| child.wait())).await;
    let failed = statuses
        .iter()
        .filter(|status| !matches!(status, Ok(s) if s.success()))
        .count();
    if failed > 0 {
        anyhow::bail!("{} of {} worker processes exited with an error", failed, count);
    }
    Ok(())
}

async fn run_computation(
    config_path: Option<&Path>,
    computation: &str,
    workers: Option<u32>,
    length: Option<u64>,
    local: Option<usize>,
) -> anyhow::Result<()> {
    let mut config = BrokerMrConfig::load(config_path)?;
    if let Some(workers) = workers {
        config.coordinator.workers = workers;
        config.validate()?;
    }

    let entry = BUILTIN.get(computation)?;
    let factory = match length {
        Some(length) => entry.default_factory().with_declared_length(length),
        None => entry.default_factory(),
    };

    let broker = BrokerFactory::from_config(&config.broker)
        .await
        .map_err(MapReduceError::from)?;

    let local = local.or_else(|| {
        (config.broker.backend == BrokerBackend::Memory)
            .then_some(config.coordinator.workers as usize)
    });
    let pool = match local {
        Some(size) if size > 0 => Some(
            WorkerPool::start(
                Arc::clone(&entry.computation),
                Arc::clone(&broker),
                config.worker.clone(),
                size,
            )
            .await?,
        ),
        _ => None,
    };

    let coordinator = Coordinator::new(broker, config.coordinator.clone());
    let started = Instant::now();
    let result = coordinator
        .run_dyn(entry.computation.as_ref(), &factory)
        .await;
    let elapsed = started.elapsed();

    if let Some(pool) = pool {
        match pool.shutdown().await {
            Ok(stats) => debug!(replied = stats.replied, "Local workers stopped"),
            Err(e) => warn!("Local workers stopped with error: {}", e),
        }
    }

    let value = result?;
    let summary = json!({
        "computation": entry.name(),
        "workers": config.coordinator.workers,
        "result": value,
        "elapsed_ms": elapsed.as_millis() as u64,
        "finished_at": chrono::Utc::now().to_rfc3339(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

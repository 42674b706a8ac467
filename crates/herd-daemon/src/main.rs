#![forbid(unsafe_code)]

//! **herd-daemon** – The herd controller daemon and client CLI.
//!
//! `herd start` boots the node: configuration, logging, store, executor,
//! crash recovery, failure detector, and finally the RPC surface, in that
//! order - recovery always finishes before the detector or any client can
//! enqueue new work. `herd call` is the thin client side, speaking the same
//! JSON envelope the server serves.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter};
use uuid::Uuid;

use herd_detector::{DetectorConfig, FailureDetector};
use herd_engine::{ActionRegistry, Executor, ExecutorConfig};
use herd_events::EventRegistry;
use herd_ha::{ServerProbe, TcpProbe};
use herd_lock::LockManager;
use herd_rpc::{commands, NodeContext};
use herd_store::Store;
use herd_types::Error;

mod client;
mod config;

use config::HerdConfig;

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "herd")]
#[command(about = "herd - management and high-availability controller for replicated database fleets")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the controller node.
    Start {
        /// Site configuration file (default /etc/herd/herd.toml, optional).
        #[arg(long)]
        config: Option<String>,

        /// Extra configuration file overriding the site file.
        #[arg(long)]
        extra_config: Option<String>,

        /// Override a single option as section.name=value; repeatable.
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },
    /// Send one command to a running node.
    Call {
        /// Method name, e.g. group.create.
        method: String,

        /// Command arguments; JSON is accepted, anything else is a string.
        args: Vec<String>,

        /// Node address; defaults to the configured protocol.xmlrpc.address.
        #[arg(long)]
        address: Option<String>,

        /// Site configuration file used to find the node address.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Start {
            config,
            extra_config,
            params,
        } => match start(config.as_deref(), extra_config.as_deref(), &params).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("herd failed to start: {err:#}");
                ExitCode::from(1)
            }
        },
        Command::Call {
            method,
            args,
            address,
            config,
        } => {
            let address = match address {
                Some(address) => address,
                None => match HerdConfig::load(config.as_deref(), None, &[]) {
                    Ok(cfg) => cfg.address,
                    Err(err) => {
                        eprintln!("cannot load configuration: {err}");
                        return ExitCode::from(2);
                    }
                },
            };
            client::call(&address, &method, &args).await
        }
    }
}

//─────────────────────────────
//  Node startup
//─────────────────────────────

async fn start(site: Option<&str>, extra: Option<&str>, params: &[String]) -> Result<()> {
    let cfg = HerdConfig::load(site, extra, params).context("configuration")?;
    let log_level = init_logging(&cfg)?;

    info!(version = env!("CARGO_PKG_VERSION"), "starting herd node");
    info!(address = %cfg.address, database = %cfg.database, workers = cfg.workers,
          sessions = cfg.rpc_threads, "configuration loaded");

    // 1. Persistence.
    let store = if cfg.database == ":memory:" {
        Store::in_memory().await?
    } else {
        Store::open(&cfg.database).await?
    };

    // 2. Action and event tables, populated once, before any work exists.
    let probe: Arc<dyn ServerProbe> = Arc::new(TcpProbe::default());
    let mut actions = ActionRegistry::new();
    herd_ha::register_actions(&mut actions, store.clone(), probe.clone());
    let mut events = EventRegistry::new();
    herd_ha::register_events(&mut events);
    let events = Arc::new(events);

    // 3. Executor.
    let executor = Executor::new(
        store.clone(),
        LockManager::new(),
        Arc::new(actions),
        ExecutorConfig {
            workers: cfg.workers,
        },
    );
    executor.start().await;

    // 4. Crash recovery, with the detector and RPC still down.
    if herd_engine::recover(&executor, &store).await {
        warn!("recovery reported failures; inspect the log before trusting the fleet state");
    }

    // 5. Retention sweep, now and then hourly.
    spawn_retention_sweep(store.clone(), executor.clone(), cfg.retention);

    // 6. Failure detector.
    let detector = FailureDetector::new(
        store.clone(),
        executor.clone(),
        events.clone(),
        probe.clone(),
        DetectorConfig {
            period: cfg.detector_period,
            failures_to_down: cfg.failures_to_down,
            ..DetectorConfig::default()
        },
    );
    detector.register_groups().await;
    detector.start_supervisor();

    // 7. RPC surface, last.
    let shutdown = CancellationToken::new();
    let ctx = Arc::new(NodeContext {
        node_uuid: Uuid::new_v4(),
        started_at: Utc::now(),
        ttl: cfg.ttl,
        store,
        executor: executor.clone(),
        events,
        detector: detector.clone(),
        probe,
        log_level,
        shutdown: shutdown.clone(),
    });
    let registry = commands::register_all();

    let address = cfg.address.clone();
    let server = tokio::spawn(async move { herd_rpc::serve(&address, ctx, registry).await });

    tokio::select! {
        _ = shutdown.cancelled() => info!("stop requested over RPC"),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            shutdown.cancel();
        }
    }

    // Orderly teardown: no new probes, drain the executor, stop the server.
    detector.shutdown();
    executor.shutdown().await;
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(error = %err, "RPC server error during shutdown"),
        Err(err) => error!(error = %err, "RPC server task panicked"),
    }
    info!("herd node stopped");
    Ok(())
}

fn spawn_retention_sweep(store: Store, executor: Executor, retention: Duration) {
    tokio::spawn(async move {
        loop {
            match store
                .purge_terminal(chrono::Duration::from_std(retention).unwrap_or_default())
                .await
            {
                Ok(purged) if !purged.is_empty() => {
                    executor.forget(&purged);
                    info!(count = purged.len(), "purged terminal procedures");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "retention sweep failed"),
            }
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    });
}

//─────────────────────────────
//  Logging
//─────────────────────────────

/// Install the tracing subscriber and hand back the runtime reload hook
/// `manage.logging_level` uses.
fn init_logging(cfg: &HerdConfig) -> Result<herd_rpc::context::LogLevelHook> {
    let filter = EnvFilter::try_new(&cfg.log_level)
        .map_err(|e| Error::Config(format!("bad logging.level ({}): {e}", cfg.log_level)))?;
    let (filter, handle) = reload::Layer::new(filter);

    match &cfg.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::Config(format!("cannot open logging.url ({path}): {e}")))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(Arc::new(file)))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    Ok(Arc::new(move |level: &str| {
        let filter = EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("bad level ({level}): {e}")))?;
        handle
            .reload(filter)
            .map_err(|e| Error::Config(format!("cannot change log level: {e}")))
    }))
}

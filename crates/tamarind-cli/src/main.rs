//! `tamarind` - operator CLI for ensemble-backed locks.
//!
//! Talks to a ZooKeeper ensemble by default; `--memory` runs the command
//! against a throwaway in-process ensemble instead, which is mostly useful
//! for `contend`.

mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;
use tamarind_client::{
    AcquireOptions, Acquisition, ClientConfig, FaultPolicy, LockManager, SessionManager,
    ZkConnector, metrics,
};
use tamarind_common::Connector;
use tamarind_ensemble::MemoryEnsemble;
use tracing::{Level, info, warn};

use crate::logging::{LoggingConfig, init_logging};

#[derive(Debug, Parser)]
#[command(name = "tamarind", version, about = "Distributed locks on a ZooKeeper ensemble")]
struct Cli {
    /// Client config file; `TAMARIND_*` variables override it
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
    /// Comma-separated `host:port` list
    #[arg(short = 'e', long = "endpoints", value_delimiter = ',')]
    endpoints: Vec<String>,
    #[arg(long = "lock-root")]
    lock_root: Option<String>,
    #[arg(long = "connect-timeout-ms")]
    connect_timeout_ms: Option<u64>,
    /// Use an in-process ensemble
    #[arg(long = "memory")]
    memory: bool,
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Acquire a lock, hold it, then release it
    Acquire {
        resource: String,
        /// How long to hold; 0 holds until Ctrl-C
        #[arg(long = "hold-ms", default_value_t = 0)]
        hold_ms: u64,
        /// Give up after this long
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
        /// Fail on the first ensemble fault instead of retrying
        #[arg(long = "fail-fast")]
        fail_fast: bool,
        /// Make one attempt and fail if the lock is held
        #[arg(long = "no-wait", conflicts_with = "timeout_ms")]
        no_wait: bool,
    },
    /// Show whether a resource is locked and by which session
    Status { resource: String },
    /// Print a node's payload
    Read { path: String },
    /// Overwrite a node's payload, optionally under a lock
    Write {
        path: String,
        value: String,
        #[arg(long = "lock")]
        lock: Option<String>,
    },
    /// Increment a shared counter from many workers, each on its own session
    Contend {
        #[arg(long = "workers", default_value_t = 10)]
        workers: usize,
        #[arg(long = "rounds", default_value_t = 1)]
        rounds: usize,
        #[arg(long = "resource", default_value = "counter")]
        resource: String,
        #[arg(long = "path", default_value = "/tamarind/counter")]
        path: String,
    },
}

impl Cli {
    fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = ClientConfig::load(self.config.as_deref())?;
        if !self.endpoints.is_empty() {
            config = config.with_endpoints(self.endpoints.clone());
        }
        if let Some(root) = &self.lock_root {
            config = config.with_lock_root(root.clone());
        }
        if let Some(ms) = self.connect_timeout_ms {
            config = config.with_connect_timeout(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }

    fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let logging_config = LoggingConfig::from_env().with_verbosity(cli.log_level());
    let _logging_guard = init_logging(&logging_config)?;
    metrics::init_metrics();

    let config = cli.client_config()?;
    let ensemble = cli
        .memory
        .then(|| MemoryEnsemble::new().with_expiry_scanner(Duration::from_secs(1)));
    let connector: Arc<dyn Connector> = match &ensemble {
        Some(ensemble) => Arc::new(ensemble.connector()),
        None => Arc::new(ZkConnector::new()),
    };

    match cli.command {
        Command::Acquire {
            resource,
            hold_ms,
            timeout_ms,
            fail_fast,
            no_wait,
        } => {
            let session = connect(&config, &connector).await?;
            let result = acquire(&session, &resource, hold_ms, timeout_ms, fail_fast, no_wait).await;
            session.close().await?;
            result?;
        }
        Command::Status { resource } => {
            let session = connect(&config, &connector).await?;
            let locks = session.lock_manager();
            let holder = locks.holder(&resource).await?;
            println!(
                "{}",
                json!({
                    "resource": resource,
                    "path": locks.lock_path(&resource)?,
                    "locked": holder.is_some(),
                    "holder": holder.map(|id| format!("0x{:x}", id)),
                })
            );
            session.close().await?;
        }
        Command::Read { path } => {
            let session = connect(&config, &connector).await?;
            let value = session.data_accessor().read_string(&path).await?;
            println!("{}", value);
            session.close().await?;
        }
        Command::Write { path, value, lock } => {
            let session = connect(&config, &connector).await?;
            let data = session.data_accessor();
            match lock {
                Some(resource) => {
                    session
                        .lock_manager()
                        .with_lock(&resource, || data.write_string(&path, &value))
                        .await??;
                }
                None => data.write_string(&path, &value).await?,
            }
            session.close().await?;
        }
        Command::Contend {
            workers,
            rounds,
            resource,
            path,
        } => {
            contend(&config, &connector, workers, rounds, &resource, &path).await?;
            if let Some(ensemble) = &ensemble {
                println!("{}", serde_json::to_string_pretty(&ensemble.stats())?);
            }
        }
    }

    Ok(())
}

async fn connect(
    config: &ClientConfig,
    connector: &Arc<dyn Connector>,
) -> anyhow::Result<Arc<SessionManager>> {
    SessionManager::connect(config.clone(), connector.clone())
        .await
        .with_context(|| format!("connecting to {}", config.endpoints.join(",")))
}

async fn acquire(
    session: &Arc<SessionManager>,
    resource: &str,
    hold_ms: u64,
    timeout_ms: Option<u64>,
    fail_fast: bool,
    no_wait: bool,
) -> anyhow::Result<()> {
    let locks = session.lock_manager();
    if no_wait {
        let acquired = locks.acquire_nowait(resource).await?;
        return hold(session, &locks, resource, acquired, hold_ms).await;
    }

    let mut options = AcquireOptions::default();
    if let Some(ms) = timeout_ms {
        options = options.with_deadline(Duration::from_millis(ms));
    }
    if fail_fast {
        options = options.with_fault_policy(FaultPolicy::FailFast);
    }

    let acquired = locks.acquire_with(resource, options).await?;
    hold(session, &locks, resource, acquired, hold_ms).await
}

async fn hold(
    session: &Arc<SessionManager>,
    locks: &LockManager,
    resource: &str,
    acquired: Acquisition,
    hold_ms: u64,
) -> anyhow::Result<()> {
    println!(
        "{}",
        json!({
            "resource": resource,
            "path": acquired.path,
            "session": format!("0x{:x}", session.session_id()),
            "attempts": acquired.attempts,
            "waited_ms": acquired.waited.as_millis() as u64,
        })
    );

    if hold_ms > 0 {
        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    } else {
        info!(resource, "Holding lock until interrupted");
        tokio::signal::ctrl_c().await?;
    }

    if !locks.release(resource).await {
        warn!(resource, "Lock node was already gone at release");
    }
    Ok(())
}

async fn contend(
    config: &ClientConfig,
    connector: &Arc<dyn Connector>,
    workers: usize,
    rounds: usize,
    resource: &str,
    path: &str,
) -> anyhow::Result<()> {
    let setup = connect(config, connector).await?;
    let data = setup.data_accessor();
    data.create(path, b"0").await?;
    data.write_string(path, "0").await?;

    let tasks = (0..workers).map(|worker| async move {
        let session = connect(config, connector).await?;
        let locks = session.lock_manager();
        let data = session.data_accessor();
        for _ in 0..rounds {
            locks
                .with_lock(resource, || async {
                    let current: u64 = data.read_string(path).await?.trim().parse()?;
                    data.write_string(path, &(current + 1).to_string()).await?;
                    anyhow::Ok(())
                })
                .await??;
        }
        info!(worker, "Worker finished");
        session.close().await?;
        anyhow::Ok(())
    });
    for result in futures::future::join_all(tasks).await {
        result?;
    }

    let total = data.read_string(path).await?;
    println!(
        "{}",
        json!({
            "workers": workers,
            "rounds": rounds,
            "expected": workers * rounds,
            "counter": total.trim(),
        })
    );
    setup.close().await?;
    Ok(())
}

//! Parallel Compute Cluster master
//!
//! Connects to every worker of the roster, brings the cluster into parallel
//! mode and runs one command on it.
//!
//! # Usage
//!
//! ```bash
//! # Show the workers and their status
//! pcc-master --config cluster.toml status
//!
//! # Use a classic roster file and four workers
//! pcc-master --roster proof.conf --parallel 4 exec '.x analysis.C'
//!
//! # Upload and enable a package
//! pcc-master --config cluster.toml upload mylib.par
//! pcc-master --config cluster.toml enable mylib
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cluster_core::registry::Scope;
use cluster_core::{ClusterConfig, Coordinator, InterruptKind, Roster, TcpTransport};

/// Parallel Compute Cluster master
#[derive(Parser, Debug)]
#[command(name = "pcc-master")]
#[command(about = "Master for the parallel compute cluster")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Line-oriented roster file; replaces the configured workers
    #[arg(short, long)]
    roster: Option<PathBuf>,

    /// Number of workers to activate (default: all)
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Refresh and print the worker table
    Status,
    /// Run a command line on the workers
    Exec {
        command: String,
        #[arg(long, value_enum, default_value = "active")]
        scope: ScopeArg,
    },
    /// Ship a file to the active workers
    SendFile {
        path: PathBuf,
        #[arg(long)]
        binary: bool,
    },
    /// Upload a .par package to one worker per filesystem image
    Upload {
        path: PathBuf,
        /// Parallel upload streams (default: transfer.bulk_streams)
        #[arg(long)]
        streams: Option<u32>,
    },
    /// Build and load a package
    Enable { package: String },
    /// Empty the remote file caches
    ClearCache,
    /// Interrupt the workers
    Interrupt {
        #[arg(value_enum, default_value = "hard")]
        kind: KindArg,
        #[arg(long, value_enum, default_value = "active")]
        scope: ScopeArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ScopeArg {
    All,
    Active,
    Unique,
}

impl From<ScopeArg> for Scope {
    fn from(arg: ScopeArg) -> Self {
        match arg {
            ScopeArg::All => Scope::All,
            ScopeArg::Active => Scope::Active,
            ScopeArg::Unique => Scope::Unique,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Hard,
    Soft,
}

fn load_config(args: &Args) -> cluster_core::Result<ClusterConfig> {
    let mut config = match &args.config {
        Some(path) => ClusterConfig::from_file(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(path) = &args.roster {
        config = config.with_roster(Roster::from_file(path)?);
    }
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

async fn run(coord: &mut Coordinator, command: &Command) -> cluster_core::Result<i32> {
    match command {
        Command::Status => {
            coord.ask_status().await;
            print!("{}", coord.print());
            let totals = coord.totals();
            println!(
                "Totals: {} bytes read, {:.2}s real, {:.2}s cpu",
                totals.bytes_read, totals.real_time, totals.cpu_time
            );
            Ok(0)
        }
        Command::Exec { command, scope } => coord.exec(command, (*scope).into()).await,
        Command::SendFile { path, binary } => {
            let sent = coord.send_file(path, *binary).await?;
            println!("{} sent to {} workers", path.display(), sent);
            Ok(0)
        }
        Command::Upload { path, streams } => {
            let streams = streams.unwrap_or(coord.config().transfer.bulk_streams);
            let report = coord.upload_package(path, streams).await?;
            for (id, e) in &report.failed {
                tracing::error!("Worker {}: {}", id, e);
            }
            Ok(if report.is_success() { 0 } else { 1 })
        }
        Command::Enable { package } => {
            coord.enable_package(package).await?;
            Ok(0)
        }
        Command::ClearCache => Ok(coord.clear_cache().await),
        Command::Interrupt { kind, scope } => {
            let kind = match kind {
                KindArg::Hard => InterruptKind::Hard,
                KindArg::Soft => InterruptKind::Soft,
            };
            let report = coord.interrupt(kind, (*scope).into()).await;
            for (id, e) in &report.failures {
                tracing::warn!("Worker {}: {}", id, e);
            }
            Ok(if report.is_clean() { 0 } else { 1 })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    tracing::info!("Starting PCC master");
    tracing::info!("  Role: {:?}", config.session.role);
    tracing::info!("  Workers in roster: {}", config.workers.len());

    let transport = TcpTransport::new(&config);
    let mut coord = Coordinator::start(config, &transport).await?;
    if let Some(nodes) = args.parallel {
        coord.set_parallel(nodes).await;
    }

    let outcome = tokio::select! {
        result = run(&mut coord, &args.command) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    if outcome.is_none() {
        tracing::warn!("Interrupted, synchronizing workers...");
        coord.interrupt(InterruptKind::Hard, Scope::Active).await;
    }

    coord.close().await;

    match outcome {
        Some(Ok(0)) | None => Ok(()),
        Some(Ok(status)) => Err(format!("command finished with status {}", status).into()),
        Some(Err(e)) => Err(e.into()),
    }
}

//! Demonsaw CLI
//!
//! Run a router, connect to one, or move files through its relay.

mod config;
mod progress;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use demonsaw_core::machine::run;
use demonsaw_core::session::short_id;
use demonsaw_core::{
    ClientMachine, EventBus, Group, MachineHandle, Role, Router, ServerMachine, Status,
    TransferJob, TransferManager,
};
use demonsaw_crypto::random::random_id;
use tracing_subscriber::EnvFilter;

use config::Config;
use progress::{TransferProgress, format_bytes};

/// Demonsaw - encrypted rendezvous file sharing
#[derive(Parser)]
#[command(name = "demonsaw")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Router host (overrides the configuration file)
    #[arg(long, global = true)]
    address: Option<String>,

    /// Router port (overrides the configuration file)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a router
    Router,

    /// Handshake with a router and print its version
    Probe,

    /// Stay connected to a router until Ctrl+C
    Client,

    /// Send a file through the router relay
    Upload {
        /// File to send
        #[arg(short, long)]
        file: PathBuf,

        /// Transfer id to share with the receiver (random when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Receive a file through the router relay
    Download {
        /// Transfer id printed by the sender
        #[arg(long)]
        id: String,

        /// File size in bytes
        #[arg(long)]
        size: u64,

        /// Output file
        #[arg(short, long, default_value = "download.bin")]
        output: PathBuf,
    },

    /// Derive the group key from the configured entropy sources
    Group,

    /// Print the effective configuration
    Config,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    if let Commands::Init { force } = cli.command {
        return init_config(&config_path, force);
    }

    let mut config = if cli.config.is_some() {
        Config::load(&config_path)?
    } else {
        Config::load_or_default()?
    };
    if let Some(address) = cli.address {
        config.router.address.clone_from(&address);
        config.machine.address = address;
    }
    if let Some(port) = cli.port {
        config.router.port = port;
        config.machine.port = port;
    }
    config.validate()?;

    let level = if cli.verbose { "debug" } else { config.logging.level.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    match cli.command {
        Commands::Router => run_router(&config).await?,
        Commands::Probe => probe(&config).await?,
        Commands::Client => run_client(&config).await?,
        Commands::Upload { file, id } => upload(file, id, &config).await?,
        Commands::Download { id, size, output } => download(id, size, output, &config).await?,
        Commands::Group => show_group(&config).await?,
        Commands::Config => print!("{}", config.to_toml()?),
        Commands::Init { .. } => {}
    }

    Ok(())
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

/// Run a router until Ctrl+C
async fn run_router(config: &Config) -> anyhow::Result<()> {
    let events = EventBus::new();
    events.subscribe(|event| {
        tracing::info!("{:?} {:?}: {}", event.kind, event.action, short_id(&event.id));
    });

    let router = Router::bind(config.router.clone(), events).await?;
    println!("Demonsaw router {}", demonsaw_core::VERSION);
    println!("Listen: {}", router.local_addr());
    println!("Max transfers: {}", config.router.max_transfers);
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    router.shutdown().await;
    Ok(())
}

/// Handshake once and report the router version
async fn probe(config: &Config) -> anyhow::Result<()> {
    let mut machine = ServerMachine::new(config.machine.clone());
    let limit = config.machine.socket_timeout() * 2;
    if tokio::time::timeout(limit, run(&mut machine)).await.is_err() {
        for entry in machine.core().errors().entries() {
            eprintln!("{:?}: {}", entry.severity, entry.text);
        }
        anyhow::bail!(
            "no answer from {}:{}",
            config.machine.address,
            config.machine.port
        );
    }

    match machine.router_version() {
        Some(version) => println!("Router {}:{} runs {}", config.machine.address, config.machine.port, version),
        None => anyhow::bail!("handshake with {}:{} failed", config.machine.address, config.machine.port),
    }
    Ok(())
}

/// Join a router and ping it until Ctrl+C
async fn run_client(config: &Config) -> anyhow::Result<()> {
    let mut client = ClientMachine::new(config.machine.clone());
    if let Some(group) = load_group(config).await? {
        println!("Group: {}", group.id());
        client = client.with_group(group);
    }
    let handle = MachineHandle::spawn(client);
    println!(
        "Connecting to {}:{} as {}",
        config.machine.address, config.machine.port, config.machine.name
    );
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    let core = Arc::clone(handle.core());
    handle.shutdown().await;
    for entry in core.errors().entries() {
        tracing::debug!("{:?}: {}", entry.severity, entry.text);
    }
    Ok(())
}

async fn load_group(config: &Config) -> anyhow::Result<Option<Arc<Group>>> {
    if config.group.sources.iter().all(|source| !source.is_active()) {
        return Ok(None);
    }
    let (group, _) = Group::build(&config.group.sources, config.machine.socket_timeout()).await;
    Ok(Some(Arc::new(group?)))
}

/// Drive one job through a transfer manager until it finishes or Ctrl+C
async fn transfer(job: TransferJob, config: &Config) -> anyhow::Result<()> {
    let manager = Arc::new(TransferManager::new(config.machine.clone(), config.transfer.clone()));
    manager.push(job.clone());

    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run().await })
    };

    let progress = TransferProgress::new(job.transfer().file_size(), job.file_name());
    let status = tokio::select! {
        status = progress.follow(&job) => status,
        _ = tokio::signal::ctrl_c() => {
            println!("\nCancelling...");
            Status::Cancelled
        }
    };
    manager.stop();
    if tokio::time::timeout(Duration::from_secs(10), runner).await.is_err() {
        tracing::warn!("Transfer workers did not stop in time");
    }

    match status {
        Status::Success => Ok(()),
        other => anyhow::bail!("\"{}\" ended as {:?}", job.file_name(), other),
    }
}

/// Send a file through the relay
async fn upload(file: PathBuf, id: Option<String>, config: &Config) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let id = match id {
        Some(id) => id,
        None => random_id()?,
    };

    let mut job = TransferJob::upload(id.as_str(), &file).await?;
    if let Some(group) = load_group(config).await? {
        println!("Group: {}", group.id());
        job = job.with_group(group);
    }

    let size = job.transfer().file_size();
    println!("File: {}", file.display());
    println!("Size: {} ({} bytes)", format_bytes(size), size);
    println!("Router: {}:{}", config.machine.address, config.machine.port);
    println!("Receive with: demonsaw download --id {id} --size {size}");

    transfer(job, config).await
}

/// Receive a file through the relay
async fn download(id: String, size: u64, output: PathBuf, config: &Config) -> anyhow::Result<()> {
    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut job = TransferJob::download(id, &output, size);
    if let Some(group) = load_group(config).await? {
        println!("Group: {}", group.id());
        job = job.with_group(group);
    }

    println!("Output: {}", output.display());
    println!("Size: {}", format_bytes(size));
    println!("Router: {}:{}", config.machine.address, config.machine.port);

    transfer(job, config).await
}

/// Print the group id and the state of every entropy source
async fn show_group(config: &Config) -> anyhow::Result<()> {
    let sources = &config.group.sources;
    if sources.is_empty() {
        println!("No entropy sources configured");
        return Ok(());
    }

    let (group, statuses) = Group::build(sources, config.machine.socket_timeout()).await;
    for (source, status) in sources.iter().zip(&statuses) {
        let label = match demonsaw_core::group::classify(&source.entropy) {
            demonsaw_core::group::EntropyKind::Data => "<data>".to_string(),
            _ => source.entropy.clone(),
        };
        println!("  {:?} {} ({}, {} bits)", status, label, source.cipher, source.key_size);
    }

    let group = group?;
    if group.is_empty() {
        println!("Group: none (no active sources)");
    } else {
        println!("Group: {}", group.id());
    }
    Ok(())
}

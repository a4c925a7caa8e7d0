//! Cinnabar server binary.
//!
//! An in-memory key-value server with snapshot durability and
//! primary/replica replication.
//!
//! # Quick Start
//!
//! ```bash
//! # Start a primary on the default port (6379)
//! cinnabar
//!
//! # Start a replica following it (defaults to port 6380)
//! cinnabar --slave 127.0.0.1 6379
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;

use cinnabar_config::{CinnabarConfig, ConfigLoader};
use cinnabar_server::{Server, ServerOptions};
use cinnabar_types::Role;

/// Cinnabar - in-memory key-value store with snapshots and replication.
#[derive(Parser)]
#[command(name = "cinnabar")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run as a replica of the given primary.
    #[arg(long, num_args = 2, value_names = ["HOST", "PORT"])]
    slave: Option<Vec<String>>,

    /// Listening port (default: 6379 as primary, 6380 as replica).
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file to load instead of discovering cinnabar.toml.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory the snapshot and backup files live in.
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;

    apply_cli_overrides(&mut config, &cli)?;

    let replica_of = config.replica_of();
    let role = if replica_of.is_some() {
        Role::Replica
    } else {
        Role::Primary
    };
    let port = cli
        .port
        .or(config.server.port)
        .unwrap_or_else(|| role.default_port());
    let bind_addr = format!("{}:{}", config.server.bind_host, port);

    let mut opts = ServerOptions::new(bind_addr, config.storage.snapshot_path.clone());
    opts.backup_path = config.storage.backup_path.clone();
    opts.max_keys = config.storage.max_keys;
    opts.backlog_capacity = config.replication.backlog_capacity;
    opts.replication_id = config.replication.replication_id.clone();
    opts.replica_of = replica_of;
    opts.sweep_interval = Duration::from_secs(config.storage.sweep_interval_secs);
    opts.heartbeat_interval = Duration::from_secs(config.replication.heartbeat_interval_secs);

    let server = Server::bind(opts).context("server startup failed")?;

    register_signal_handlers(&server)?;

    server.run().context("server terminated with an error")?;
    Ok(())
}

/// CLI arguments win over every file/env source.
fn apply_cli_overrides(config: &mut CinnabarConfig, cli: &Cli) -> Result<()> {
    if let Some(slave) = &cli.slave {
        let [host, port] = slave.as_slice() else {
            bail!("--slave takes exactly <HOST> <PORT>");
        };
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid --slave port: {port}"))?;
        config.replication.master_host = Some(host.clone());
        config.replication.master_port = Some(port);
    }
    if let Some(port) = cli.port {
        config.server.port = Some(port);
    }
    if let Some(dir) = &cli.data_dir {
        // Re-root the storage files; an absolute configured path wins
        // (PathBuf::join replaces on absolute input).
        config.storage.snapshot_path = dir.join(&config.storage.snapshot_path);
        config.storage.backup_path = dir.join(&config.storage.backup_path);
    }
    Ok(())
}

/// SIGINT/SIGTERM flip the shutdown flag; the accept loop and background
/// tasks observe it and wind down.
#[cfg(unix)]
fn register_signal_handlers(server: &Server) -> Result<()> {
    let flag = server.shutdown_handle().flag();
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag.clone())
        .context("failed to register SIGINT handler")?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, flag)
        .context("failed to register SIGTERM handler")?;
    Ok(())
}

#[cfg(not(unix))]
fn register_signal_handlers(_server: &Server) -> Result<()> {
    Ok(())
}

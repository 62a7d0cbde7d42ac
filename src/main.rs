//! Backup server entry point.
//!
//! ```text
//! backup-server                      Run with defaults (port from port.info)
//! backup-server --config <path>      Load a config TOML
//! backup-server --port-file <path>   Read the listen port from a port file
//! backup-server --gen-config         Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use backup_protocol::config::BackupConfig;
use backup_protocol::storage::open_store;
use backup_protocol::transport::Server;
use backup_protocol::utils::logging::init_logging;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "backup-server", about = "Encrypted file backup server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Legacy port file; overrides the configured port.
    #[arg(long, default_value = "port.info")]
    port_file: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", BackupConfig::example_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => BackupConfig::from_file(path)?,
        None => BackupConfig::default(),
    };
    init_logging(&config.logging);

    // Without a config file the legacy port file decides the port.
    if cli.config.is_none() {
        config = config.with_port_file(&cli.port_file);
    }
    config.apply_env()?;
    config.validate_strict()?;

    // Single-threaded: connections are interleaved, never run in parallel.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(serve(config))?;
    Ok(())
}

async fn serve(config: BackupConfig) -> backup_protocol::Result<()> {
    let store = open_store(&config.storage).await?;
    let server = Server::new(config.server.clone(), store);
    let listener = server.bind().await?;
    info!(version = env!("CARGO_PKG_VERSION"), "Backup server started");

    match server.run(listener).await {
        Ok(()) => {
            info!("Server stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Server aborted");
            Err(e)
        }
    }
}

use clap::Parser;
use log::{info, warn};
use service::config::ServiceConfig;
use service::events::ServiceEvent;
use service::persistence::{FileStore, MemoryStore, PersistenceGateway};
use service::service::Service;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    #[arg(short = 'c', long, default_value = "rcon-helper.toml")]
    config: PathBuf,

    /// Override the server host from the configuration
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Override the admin port from the configuration
    #[arg(short, long)]
    port: Option<u16>,

    /// Validate the configuration and exit
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let config = ServiceConfig::load(&args.config)
        .await?
        .with_endpoint(args.host, args.port);
    config.validate()?;
    info!("Loaded configuration from {}", args.config.display());
    info!("Admin endpoint: {}", config.address());
    info!(
        "Polling every {}s, {} scheduled messages",
        config.timing.poll_interval_secs,
        config.messages.scheduled.len()
    );

    if args.dry_run {
        info!("Configuration is valid");
        return Ok(());
    }

    let history_limit = config.storage.history_limit;
    let persistence: Arc<dyn PersistenceGateway> = match &config.storage.data_file {
        Some(path) => Arc::new(FileStore::open(path, history_limit).await?),
        None => {
            warn!("No storage.data_file configured, history is kept in memory only");
            Arc::new(MemoryStore::new(history_limit))
        }
    };

    let service = Service::start(config, persistence, None).await?;
    let mut events = service.subscribe();
    let mut online = HashSet::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => track_online(&event, &mut online),
                Err(RecvError::Lagged(skipped)) => warn!("Event log fell behind, skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

/// Keeps a running count of online players from join/leave events. Every
/// other event is already logged by the component that raised it.
fn track_online(event: &ServiceEvent, online: &mut HashSet<String>) {
    let changed = match event {
        ServiceEvent::PlayerJoined(player) => online.insert(player.id.clone()),
        ServiceEvent::PlayerLeft(player) => online.remove(&player.id),
        _ => false,
    };
    if changed {
        info!("Players online: {}", online.len());
    }
}

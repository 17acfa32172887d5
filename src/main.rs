//! Platform listener worker process
//!
//! Runs one listener for the configured platform until a signal, a fatal
//! escalation or a closed job queue stops it.

use clap::{Parser, Subcommand};
use platform_listener::config::{ListenerConfig, QueueBackend};
use platform_listener::listener::{Listener, ListenerState};
use platform_listener::observability::{health::HealthServer, init_default_logging, metrics::metrics};
use platform_listener::platform::PlatformCatalog;
use platform_listener::queue::{JobQueue, MemoryQueue, MqttQueue};
use platform_listener::session::LocalSessionStore;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Exit status used after a fatal escalation so the supervisor respawns us
const EXIT_FATAL: i32 = 70;

/// Platform listener for the protocol gateway
#[derive(Parser)]
#[command(name = "platform-listener")]
#[command(about = "Consumes platform jobs from the gateway queue and dispatches them")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the listener
    Run,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose > 0 && std::env::var("LOG_LEVEL").is_err() {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        std::env::set_var("LOG_LEVEL", level);
    }
    init_default_logging();

    info!("Starting platform listener v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_listener(config).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    match result {
        Ok(code) => {
            info!("Application shutdown complete");
            if code != 0 {
                process::exit(code);
            }
        }
        Err(e) => {
            error!("Command failed: {}", e);
            process::exit(1);
        }
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<ListenerConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(ListenerConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["listener.toml", "config/listener.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(ListenerConfig::load_from_file(&path)?);
                }
            }
            Err("No configuration file found. Provide one with -c/--config or create listener.toml".into())
        }
    }
}

/// Queue factory for the configured backend
async fn create_queue(config: &ListenerConfig) -> Result<Arc<dyn JobQueue>, Box<dyn std::error::Error>> {
    match config.queue.backend {
        QueueBackend::Mqtt => {
            let queue = MqttQueue::connect(&config.platform.name, &config.queue).await?;
            Ok(Arc::new(queue))
        }
        QueueBackend::Memory => {
            warn!("Using in-memory queue; jobs can only come from this process");
            Ok(Arc::new(MemoryQueue::new()))
        }
    }
}

async fn run_listener(config: ListenerConfig) -> Result<i32, Box<dyn std::error::Error>> {
    let collector = metrics();
    collector.set_listener_state("initializing");
    info!(platform = %config.platform.name, "Listener starting");

    let queue = create_queue(&config).await?;
    let sessions = Arc::new(match config.get_enc_key() {
        Some(key) => LocalSessionStore::with_enc_key(config.channels(), queue.clone(), &key),
        None => LocalSessionStore::new(config.channels(), queue.clone()),
    });

    let catalog = PlatformCatalog::builtin(&config);
    let listener = Arc::new(Listener::new(
        config.clone(),
        &catalog,
        queue.clone(),
        sessions,
    )?);

    if config.health.enabled {
        let health_server = Arc::new(HealthServer::new(
            config.platform.name.clone(),
            config.health.port,
        ));
        health_server.set_queue_connected(queue.is_connected());
        listener.set_health_server(health_server.clone());
        tokio::spawn(health_server.start());
    }

    let mut fatal_rx = listener
        .take_fatal_receiver()
        .ok_or("fatal receiver already taken")?;
    let mut state = listener.state_watch();

    listener.start()?;

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    let exit_code = tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully...");
            listener.shutdown(None).await;
            0
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully...");
            listener.shutdown(None).await;
            0
        }
        Some(fatal) = fatal_rx.recv() => {
            error!(error = %fatal, "Fatal escalation, resetting platform");
            listener.shutdown(None).await;
            EXIT_FATAL
        }
        _ = state.wait_for(|s| *s == ListenerState::Stopped) => {
            info!("Listener stopped");
            0
        }
    };

    queue.close().await;
    collector.set_listener_state("stopped");
    Ok(exit_code)
}

fn handle_config_command(config: ListenerConfig, show: bool) -> Result<i32, Box<dyn std::error::Error>> {
    if show {
        println!("Current listener configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(0)
}

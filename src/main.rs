//! Coasters - replicated coaster registry node
//!
//! Runs one node of the fleet: HTTP writes, the replication apply loop,
//! the leadership lock and the leader-only status reporter. Also hosts
//! the coordination broker the fleet shares.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

use coasters::api::HttpServer;
use coasters::config::{Backend, CoastersConfig, LoggingConfig, ENV_VAR};
use coasters::coordination::{BrokerServer, LockService, MemoryCoordinator, PubSub, RemoteCoordinator};
use coasters::error::{Error, Result};
use coasters::model::Coaster;
use coasters::replication::{MutationBus, Replicator};
use coasters::reporter::{ConsoleSink, Reporter};
use coasters::shutdown;
use coasters::state::{LeaseConfig, LockCoordinator};
use coasters::store::RecordStore;

/// Coasters - replicated coaster registry
#[derive(Parser)]
#[command(name = "coasters")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "coasters.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a coasters node
    Start,

    /// Run the coordination broker shared by a fleet
    Broker {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:7700")]
        listen: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "coasters.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start => run_start(cli.config, cli.log_level).await,
        Commands::Broker { listen } => {
            let level = cli.log_level.unwrap_or_else(|| "info".to_string());
            init_logging(&level, &LoggingConfig::default())?;
            run_broker(listen).await
        }
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging. With a log file configured the console is left
/// to the status reporter.
fn init_logging(level: &str, logging: &LoggingConfig) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let writer = match &logging.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(logging.file.is_none());
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if logging.format == "json" {
        fmt_layer.json().boxed()
    } else {
        fmt_layer.boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
    }
}

/// Log the outcome of a background task
fn report_task(name: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!("{} failed: {}", name, e);
            Err(e)
        }
        Err(e) => {
            tracing::error!("{} task aborted: {}", name, e);
            Err(Error::Internal(format!("{} task aborted: {}", name, e)))
        }
    }
}

/// Start a coasters node
async fn run_start(config_path: PathBuf, log_level: Option<String>) -> Result<()> {
    let mut config = match CoastersConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    config.apply_env_override(std::env::var(ENV_VAR).ok().as_deref());

    let level = log_level.unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging)?;
    tracing::info!(
        "Starting coasters node {} in {} environment",
        config.node.id,
        config.environment()
    );

    // Coordination backend
    let (lock, pubsub): (Arc<dyn LockService>, Arc<dyn PubSub>) = match config.coordination.backend {
        Backend::Memory => {
            tracing::info!("Using in-process coordination; leadership is local to this process");
            let client = Arc::new(MemoryCoordinator::new().client());
            let lock: Arc<dyn LockService> = client.clone();
            let pubsub: Arc<dyn PubSub> = client;
            (lock, pubsub)
        }
        Backend::Broker => {
            let remote = Arc::new(RemoteCoordinator::new(
                config.coordination.broker_address.clone().unwrap_or_default(),
                config.connect_timeout(),
                config.request_timeout(),
            ));
            match remote.ping().await {
                Ok(()) => tracing::info!("Connected to coordination broker at {}", remote.address()),
                Err(e) => tracing::warn!(
                    "Coordination broker at {} not reachable yet, will keep retrying: {}",
                    remote.address(),
                    e
                ),
            }
            let lock: Arc<dyn LockService> = remote.clone();
            let pubsub: Arc<dyn PubSub> = remote;
            (lock, pubsub)
        }
    };

    let store = RecordStore::<Coaster>::new(config.store_dir());
    tracing::info!("Record store at {:?}", store.base_dir());

    let bus = Arc::new(MutationBus::<Coaster>::new(pubsub, config.channel_name()));
    let (trigger, signal) = shutdown::channel();

    // Apply loop
    let listener = bus
        .subscribe(Arc::new(Replicator::new(store.clone())), signal.clone())
        .await?;

    // Leadership
    let coordinator = Arc::new(LockCoordinator::new(
        config.node.id.clone(),
        LeaseConfig::new(config.lease_key(), config.lease_ttl()),
        lock,
    ));
    let leadership = coordinator.watch();
    let lock_task = {
        let coordinator = Arc::clone(&coordinator);
        let signal = signal.clone();
        tokio::spawn(async move { coordinator.acquire_and_hold(signal).await })
    };

    // Reporter
    let reporter_task: Option<JoinHandle<()>> = if config.reporter.enabled {
        let reporter = Reporter::new(
            Arc::new(store.clone()),
            leadership.clone(),
            Arc::new(ConsoleSink),
            config.report_interval(),
        );
        Some(tokio::spawn(reporter.run(signal.clone())))
    } else {
        tracing::info!("Status reporter disabled");
        None
    };

    // HTTP API
    let api_enabled = config.api.enabled;
    let server = HttpServer::new(
        config.api.clone(),
        config.node.id.clone(),
        store,
        Arc::clone(&bus),
        leadership,
    );
    let mut http_task = {
        let signal = signal.clone();
        tokio::spawn(async move { server.start(signal).await })
    };

    let mut outcome = Ok(());
    let http_finished = tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Received shutdown signal");
            false
        }
        result = &mut http_task, if api_enabled => {
            outcome = report_task("HTTP API", result);
            true
        }
    };

    let _ = trigger.send(true);

    if !http_finished {
        outcome = outcome.and(report_task("HTTP API", http_task.await));
    }
    if let Err(e) = lock_task.await {
        tracing::error!("Lock coordinator task aborted: {}", e);
    }
    if let Some(task) = reporter_task {
        if let Err(e) = task.await {
            tracing::error!("Status reporter task aborted: {}", e);
        }
    }
    if let Err(e) = listener.await {
        tracing::error!("Replication listener task aborted: {}", e);
    }

    tracing::info!("Coasters node {} stopped", config.node.id);
    outcome
}

/// Run the coordination broker
async fn run_broker(listen: String) -> Result<()> {
    let broker = Arc::new(BrokerServer::new(listen));
    let mut task = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.start().await })
    };

    tokio::select! {
        _ = wait_for_signal() => {
            tracing::info!("Received shutdown signal");
        }
        result = &mut task => {
            return report_task("Coordination broker", result);
        }
    }

    broker.stop();
    report_task("Coordination broker", task.await)
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    if output.exists() {
        eprintln!("Refusing to overwrite existing file {}", output.display());
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let config_content = format!(
        r#"# Coasters Configuration
# Generated configuration file

[node]
id = "{node_id}"
# dev or prod; COASTERS_ENV=prod overrides
environment = "dev"
data_dir = "/var/lib/coasters"

[coordination]
# memory: single process; broker: shared `coasters broker`
backend = "memory"
# broker_address = "10.0.0.10:7700"
lease_ttl_ms = 10000
connect_timeout_ms = 2000
request_timeout_ms = 2000

[reporter]
enabled = true
interval_ms = 1000

[api]
enabled = true
bind_address = "0.0.0.0:3000"

[logging]
level = "info"
format = "pretty"
# file = "/var/log/coasters/coasters.log"
"#
    );

    // The template must stay loadable
    CoastersConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("Then start with: coasters start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match CoastersConfig::from_file(&config_path) {
        Ok(mut config) => {
            config.apply_env_override(std::env::var(ENV_VAR).ok().as_deref());
            println!("✓ Configuration is valid");
            println!("  Node ID:     {}", config.node.id);
            println!("  Environment: {}", config.environment());
            println!("  Store:       {}", config.store_dir().display());
            println!("  Lease key:   {}", config.lease_key());
            println!("  Channel:     {}", config.channel_name());
            println!("  Backend:     {:?}", config.coordination.backend);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

//! fieldlink - keeps a fleet of field devices connected to Azure IoT Hub

use fieldlink::config::FleetConfig;
use fieldlink::fleet::run_fleet;
use fieldlink::hmi::{self, EventStore, JsonlEventStore, DEFAULT_EVENT_LIMIT};
use fieldlink::observability::init_default_logging;
use fieldlink::runner::DeviceRunner;
use fieldlink::telemetry::sample_reading;
use fieldlink::transport::mqtt::IotHubClient;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn, Level};

/// Per-device Azure IoT Hub connection runner
#[derive(Parser)]
#[command(name = "fieldlink")]
#[command(about = "Keeps field devices connected to Azure IoT Hub and their telemetry flowing")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "FIELDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect every configured device and run until interrupted
    Run {
        /// Enqueue a sample reading for every device at this interval
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        sample_interval: Option<u64>,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Print recorded HMI events, newest first
    Events {
        /// Only events for this method
        #[arg(long)]
        method: Option<String>,
        /// Maximum number of events
        #[arg(long, default_value_t = DEFAULT_EVENT_LIMIT)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging(verbosity_level(cli.verbose));

    info!("Starting fieldlink v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { sample_interval } => {
            run_devices(config, sample_interval.map(Duration::from_secs)).await
        }
        Commands::Config { show } => handle_config_command(&config, show),
        Commands::Events { method, limit } => handle_events_command(&config, method, limit),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn verbosity_level(verbose: u8) -> Option<Level> {
    match verbose {
        0 => None,
        1 => Some(Level::DEBUG),
        _ => Some(Level::TRACE),
    }
}

fn load_configuration(
    config_path: &Option<PathBuf>,
) -> Result<FleetConfig, Box<dyn std::error::Error>> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
    }
    let config = FleetConfig::load(config_path.as_deref())?;
    info!(devices = config.devices.len(), "Configuration loaded");
    Ok(config)
}

async fn run_devices(
    config: FleetConfig,
    sample_interval: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn EventStore> = Arc::new(JsonlEventStore::open(&config.events.path)?);

    let settings = config.transport_settings();
    let options = config.runner_options();
    let mut runners = Vec::with_capacity(config.devices.len());
    for entry in &config.devices {
        let descriptor = entry.descriptor()?;
        let transport = Arc::new(IotHubClient::from_connection_string(
            descriptor.connection_string(),
            settings.clone(),
        )?);
        if transport.device_id() != descriptor.device_id() {
            warn!(
                device_id = descriptor.device_id(),
                connection_device_id = transport.device_id(),
                "Configured device id differs from the connection string's DeviceId"
            );
        }
        runners.push(Arc::new(DeviceRunner::with_options(
            descriptor,
            transport,
            options.clone(),
        )));
    }

    let (on_message, registry) = if config.runner.receive_data {
        info!("Receive enabled, registering C2D and direct method handlers");
        let on_message = hmi::message_callback(Arc::clone(&store));
        let registry = Arc::new(hmi::build_method_registry(Arc::clone(&store)));
        (Some(on_message), Some(registry))
    } else {
        info!("Receive disabled, running in send-only mode");
        (None, None)
    };

    let producer = sample_interval.map(|period| {
        let runners = runners.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                for runner in &runners {
                    let reading = sample_reading(runner.device().n_valves());
                    if let Err(e) = runner.try_enqueue(reading) {
                        warn!(device_id = runner.device_id(), error = %e, "Sample reading dropped");
                    }
                }
            }
        })
    });

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    };

    info!(devices = runners.len(), "Devices running");
    let outcomes = run_fleet(runners, on_message, registry, shutdown).await;

    if let Some(producer) = producer {
        producer.abort();
    }

    let failures: Vec<String> = outcomes
        .iter()
        .filter_map(|outcome| {
            outcome
                .result
                .as_ref()
                .err()
                .map(|e| format!("{}: {}", outcome.device_id, e))
        })
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures.join("; ").into())
    }
}

fn handle_config_command(
    config: &FleetConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", config.redacted().to_toml_string()?);
    }

    for entry in &config.devices {
        if let Err(e) = entry.resolve_connection_string() {
            warn!(device_id = %entry.id, error = %e, "Connection string not available");
        }
    }

    info!("Configuration is valid");
    Ok(())
}

fn handle_events_command(
    config: &FleetConfig,
    method: Option<String>,
    limit: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = JsonlEventStore::open(&config.events.path)?;
    for event in store.events(method.as_deref(), limit)? {
        println!("{}", serde_json::to_string(&event)?);
    }
    Ok(())
}

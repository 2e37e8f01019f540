//! Command-line interface for the Chirpha bridge.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use chirpha_core::config::defaults;
use chirpha_core::{BridgeConfig, EventBus};
use chirpha_devices::adapters::MqttBridge;
use chirpha_devices::{BridgeService, RecordingTransport};
use chirpha_storage::create_backend;

/// Chirpha - ChirpStack LoRaWAN devices in Home Assistant.
#[derive(Parser, Debug)]
#[command(name = "chirpha")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform. Defaults to `run`.
    #[command(subcommand)]
    command: Option<Command>,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "CHIRPHA_LOG_JSON")]
    log_json: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted.
    Run {
        /// Configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Decode one uplink event file and print what would be announced.
    Decode {
        /// File holding one uplink event (JSON).
        file: PathBuf,
        /// Topic the event is treated as arriving on.
        #[arg(short, long, default_value = "application/1/device/+/event/up")]
        topic: String,
        /// Discovery prefix.
        #[arg(long, default_value = defaults::DISCOVERY_PREFIX)]
        prefix: String,
    },
    /// Resolve and validate the configuration, then print it with secrets hidden.
    CheckConfig {
        /// Configuration file (TOML).
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Run { config: None }) {
        Command::Run { config } => {
            let config = BridgeConfig::resolve(config.as_deref())?;
            init_logging(args.log_json, &config.log_level);
            run_bridge(config).await
        }
        Command::Decode {
            file,
            topic,
            prefix,
        } => {
            init_logging(args.log_json, defaults::LOG_LEVEL);
            decode_file(&file, &topic, prefix).await
        }
        Command::CheckConfig { config } => {
            let config = BridgeConfig::resolve(config.as_deref())?;
            init_logging(args.log_json, &config.log_level);
            print!("{}", config.redacted().to_toml()?);
            Ok(())
        }
    }
}

/// `RUST_LOG` wins over the configured level. Logs go to stderr.
fn init_logging(json: bool, level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::try_new(level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(defaults::LOG_LEVEL))
    });

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

async fn run_bridge(config: BridgeConfig) -> Result<()> {
    info!(
        category = "config",
        broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
        uplink_topic = %config.mqtt.uplink_topic,
        discovery_prefix = %config.discovery.prefix,
        "Configuration loaded"
    );

    let backend = create_backend(config.influxdb.as_ref())?;
    if backend.is_none() {
        info!(category = "storage", "No time-series backend configured, history backfill disabled");
    }

    let event_bus = Arc::new(EventBus::with_name("chirpha"));
    let mqtt = MqttBridge::new(&config.mqtt);
    let service = Arc::new(BridgeService::new(
        &config,
        Arc::new(mqtt.publisher()),
        backend,
        event_bus,
    ));
    let _attachment = service.spawn_host_attachment();

    tokio::select! {
        _ = mqtt.run(service.clone()) => {
            warn!("MQTT loop exited");
        }
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
    }

    let stats = service.stats();
    info!(
        received = stats.received,
        dropped = stats.dropped,
        dispatched = stats.dispatched,
        discovery_passes = stats.discovery_passes,
        publish_errors = stats.publish_errors,
        entities = service.state().entity_count(),
        "Bridge stopped"
    );
    Ok(())
}

async fn decode_file(file: &Path, topic: &str, prefix: String) -> Result<()> {
    let payload =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    let mut config = BridgeConfig::default();
    config.discovery.prefix = prefix;
    let transport = Arc::new(RecordingTransport::new());
    let service = BridgeService::offline(&config, transport.clone());

    service.handle_message(topic, &payload).await?;

    let announcements: Vec<serde_json::Value> = transport
        .published()
        .into_iter()
        .map(|(topic, payload)| {
            let config =
                serde_json::from_str(&payload).unwrap_or(serde_json::Value::String(payload));
            serde_json::json!({ "topic": topic, "config": config })
        })
        .collect();
    let report = serde_json::json!({
        "announcements": announcements,
        "entities": service.state().entities(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

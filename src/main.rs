//! MQTT bridge command-line host
//!
//! Drives a session bridge from the terminal: listen for broker traffic, publish a
//! single message, or validate a configuration file.

use mqtt_bridge::bridge::{BridgeEvent, ConnectionState, MqttBridge};
use mqtt_bridge::config::{BridgeConfig, BrokerSection};
use mqtt_bridge::observability::{init_default_logging, init_logging, LogFormat};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info, warn, Level};

/// Bridge between a terminal and an MQTT broker
#[derive(Parser)]
#[command(name = "mqtt-bridge")]
#[command(about = "MQTT session bridge with an event stream")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, overriding the configuration file
    #[arg(short, long, env = "MQTT_BROKER_URL")]
    url: Option<String>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, subscribe and print events as JSON lines until interrupted
    Listen {
        /// Topic filter to subscribe to (repeatable); defaults to the configured topics
        #[arg(short, long = "topic")]
        topics: Vec<String>,
        /// QoS for the subscriptions; defaults to the configured QoS
        #[arg(short, long)]
        qos: Option<u8>,
    },
    /// Connect, publish one message and disconnect
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 1)]
        qos: u8,
    },
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

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, log_format_from_env(), false),
        _ => init_logging(Level::TRACE, log_format_from_env(), true),
    }

    info!("Starting mqtt-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config, cli.url.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Listen { topics, qos } => run_listen(config, topics, qos).await,
        Commands::Publish {
            topic,
            message,
            qos,
        } => run_publish(config, &topic, message, qos).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn log_format_from_env() -> LogFormat {
    LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()))
}

fn load_configuration(
    config_path: &Option<PathBuf>,
    url_override: Option<&str>,
) -> Result<BridgeConfig, Box<dyn std::error::Error>> {
    let path = match config_path {
        Some(path) => Some(path.clone()),
        None => ["mqtt-bridge.toml", "config/mqtt-bridge.toml"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists()),
    };

    let mut config = match (path, url_override) {
        (Some(path), _) => {
            info!("Loading configuration from: {}", path.display());
            BridgeConfig::load_from_file(&path)?
        }
        (None, Some(url)) => BridgeConfig {
            broker: BrokerSection {
                url: url.to_string(),
                username_env: env_var_name_if_set("MQTT_USERNAME"),
                password_env: env_var_name_if_set("MQTT_PASSWORD"),
            },
            subscriptions: Default::default(),
            engine: Default::default(),
        },
        (None, None) => {
            return Err(
                "No configuration file found. Provide one with -c/--config, create mqtt-bridge.toml, or pass --url"
                    .into(),
            );
        }
    };

    if let Some(url) = url_override {
        config.broker.url = url.to_string();
    }
    config.validate()?;
    Ok(config)
}

fn env_var_name_if_set(name: &str) -> Option<String> {
    std::env::var_os(name).map(|_| name.to_string())
}

fn start_bridge(config: &BridgeConfig) -> MqttBridge {
    MqttBridge::with_rumqtt(
        config.engine.request_capacity,
        config.engine.reconnect_config(),
    )
}

async fn run_listen(
    config: BridgeConfig,
    topics: Vec<String>,
    qos: Option<u8>,
) -> Result<(), Box<dyn std::error::Error>> {
    let topics = if topics.is_empty() {
        config.subscriptions.topics.clone()
    } else {
        topics
    };
    let qos = qos.unwrap_or(config.subscriptions.qos);
    if topics.is_empty() {
        warn!("No topics to subscribe to; only lifecycle events will be printed");
    }

    let (username, password) = config.require_credentials()?;
    let bridge = start_bridge(&config);
    let mut events = bridge.add_listener(None).await;

    let message = bridge.connect(&config.broker.url, &username, &password).await?;
    info!("{}", message);

    for topic in &topics {
        let message = bridge.subscribe(topic, qos).await?;
        info!("{}", message);
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
            event = events.recv() => match event {
                Some(event) => print_event(&event)?,
                None => break,
            },
        }
    }

    if bridge.state() == ConnectionState::Connected {
        match bridge.disconnect().await {
            Ok(message) => info!("{}", message),
            Err(e) => warn!("Disconnect failed: {}", e),
        }
    }
    events.remove().await;
    bridge.shutdown().await;
    Ok(())
}

async fn run_publish(
    config: BridgeConfig,
    topic: &str,
    message: String,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let (username, password) = config.require_credentials()?;
    let bridge = start_bridge(&config);

    bridge.connect(&config.broker.url, &username, &password).await?;

    let outcome = bridge.publish(topic, message.into_bytes(), qos).await;
    if let Err(e) = bridge.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    bridge.shutdown().await;

    let published = outcome?;
    println!("{}", json!({ "result": published }));
    Ok(())
}

fn print_event(event: &BridgeEvent) -> Result<(), serde_json::Error> {
    let line = json!({
        "event": event.name().as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "body": event.to_payload(),
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn handle_config_command(
    config: BridgeConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if config.get_username().is_empty() && config.get_password().is_empty() {
        info!("No broker credentials resolved; connecting anonymously");
    }

    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}

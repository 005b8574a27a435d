use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use log::{error, warn};
use tokio::sync::mpsc;

mod address;
mod bridge;
mod button;
mod config;
mod frame;
mod gateway;
mod messages;
mod mqtt;
mod presence;
mod probe;
mod registry;
mod router;
#[cfg(test)]
mod testing;
mod timers;
mod transport;

use crate::bridge::BusBridge;
use crate::gateway::{Core, Gateway};
use crate::registry::{AssociationRegistry, DeviceProfile};
use crate::transport::{FrameTransport, OutboundQueue};

/// Bridge restaurant table modules on the wireless mesh to the MQTT bus.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the association store path from the config file
    #[arg(short, long)]
    store: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let args = Args::parse();
    let config_contents = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("reading {}", args.config.display()))?;
    let config: config::AppConfig = toml::de::from_str(&config_contents)
        .with_context(|| format!("parsing {}", args.config.display()))?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let (queue, online) = match config.transport().address {
        Some(address) => match transport::connect(&address, events_tx.clone()).await {
            Ok(queue) => (queue, true),
            Err(err) => {
                error!("Frame transport at {} unavailable: {}", address, err);
                (OutboundQueue::offline(), false)
            }
        },
        None => {
            warn!("No [transport] address configured; running without modules");
            (OutboundQueue::offline(), false)
        }
    };
    let transport: Arc<dyn FrameTransport> = Arc::new(queue);

    let store_path = args.store.unwrap_or_else(|| config.store_path());
    let registry = AssociationRegistry::restore(
        store_path,
        DeviceProfile::from_config(&config),
        transport.clone(),
    )
    .await;

    let subscriptions = BusBridge::new(&config).subscriptions();
    let (mqtt_client, eventloop) = mqtt::MqttClient::new(&config.mqtt, subscriptions);
    let bus = Arc::new(mqtt_client.clone());

    let core = Core::new(&config, registry, transport, online, bus, events_tx.clone());
    let gateway = Gateway::new(&config, core, events_rx);

    let mqtt_task = {
        let client = mqtt_client.clone();
        tokio::spawn(async move { client.event_loop(eventloop, events_tx).await })
    };

    gateway
        .run_loop(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Could not listen for shutdown signal: {}", err);
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Err(err) = mqtt_client.disconnect().await {
        warn!("Error disconnecting from MQTT: {:?}", err);
    }
    mqtt_task.abort();

    Ok(())
}

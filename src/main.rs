// LightBlue Bean bridge for the meshblu device hub

use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::signal;
use tokio::sync::mpsc;

mod bean;
mod bluetooth;
mod color;
mod config;
mod error;
mod mqtt;
mod plugin;
mod poller;
mod protocol;
mod session;
mod telemetry;
mod transport;

#[cfg(test)]
mod testing;

use mqtt::Inbound;
use session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting meshblu Bean bridge");

    // Load configuration
    let path = config::config_path();
    let config = config::load_config(&path)
        .with_context(|| format!("Failed to load configuration from {}", path))?;

    info!("Configuration loaded successfully");
    info!("Hub device: {}", config.mqtt.device);

    // Initialize BLE adapter
    let ble_adapter = bluetooth::BleAdapter::new(config.bluetooth.adapter.as_deref())
        .await
        .context("Failed to initialize BLE adapter")?;

    info!("BLE adapter initialized: {}", ble_adapter.name());

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let session = Session::spawn(Arc::new(ble_adapter), events_tx);

    // Initialize MQTT client
    let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
    let mqtt_client = mqtt::MqttClient::new(config.mqtt, inbound_tx)
        .await
        .context("Failed to initialize MQTT client")?;

    info!("MQTT client connecting to {}", mqtt_client.host());

    mqtt_client
        .publish_schemas()
        .await
        .context("Failed to publish schemas")?;

    session.configure(config.device);

    info!("Setup complete. Waiting for messages...");

    loop {
        tokio::select! {
            Some(message) = inbound.recv() => match message {
                Inbound::Message(color) => session.send_color(color),
                Inbound::Config(options) => session.configure(options),
            },
            Some(event) = events.recv() => {
                if let Err(e) = mqtt_client.publish_event(&event).await {
                    warn!("Failed to publish {:?}: {}", event, e);
                }
            }
            // Wait for shutdown signal
            result = signal::ctrl_c() => {
                result?;
                break;
            }
        }
    }

    info!("Shutting down...");
    session.close().await;

    Ok(())
}

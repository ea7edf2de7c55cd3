// MQTT hub link using rumqttc

use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;

use crate::color::ColorMessage;
use crate::config::MqttConfig;
use crate::plugin::{self, ConfigEnvelope, MessageEnvelope, Options};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Something the hub asked for.
#[derive(Debug)]
pub enum Inbound {
    Message(ColorMessage),
    Config(Options),
}

/// Topics of one hub device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub message: String,
    pub config: String,
    pub data: String,
    pub error: String,
    pub schema: String,
}

impl Topics {
    pub fn new(prefix: &str, device: &str) -> Self {
        let topic = |leaf: &str| format!("{}/{}/{}", prefix, device, leaf);
        Topics {
            message: topic("message"),
            config: topic("config"),
            data: topic("data"),
            error: topic("error"),
            schema: topic("schema"),
        }
    }

    /// Decode a publish received on one of the inbound topics.
    pub fn parse(&self, topic: &str, payload: &[u8]) -> Result<Option<Inbound>, serde_json::Error> {
        if topic == self.message {
            let envelope: MessageEnvelope = serde_json::from_slice(payload)?;
            Ok(Some(Inbound::Message(envelope.payload)))
        } else if topic == self.config {
            let envelope: ConfigEnvelope = serde_json::from_slice(payload)?;
            Ok(Some(Inbound::Config(envelope.options)))
        } else {
            Ok(None)
        }
    }
}

pub struct MqttClient {
    client: AsyncClient,
    config: MqttConfig,
    topics: Topics,
}

impl MqttClient {
    pub async fn new(
        config: MqttConfig,
        inbound: UnboundedSender<Inbound>,
    ) -> Result<Self, rumqttc::ClientError> {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        if let Some(username) = &config.username {
            mqttoptions.set_credentials(username, config.password.as_deref().unwrap_or(""));
        }

        info!("Connecting to MQTT broker: {}:{}", config.host, config.port);
        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let topics = Topics::new(&config.topic_prefix, &config.device);

        // Start event loop in background
        let subscriber = client.clone();
        let routes = topics.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT Connected");
                        // Subscriptions do not survive a clean session.
                        for topic in [&routes.message, &routes.config] {
                            if let Err(e) = subscriber.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                                error!("Subscribing to {} failed: {}", topic, e);
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        match routes.parse(&publish.topic, &publish.payload) {
                            Ok(Some(message)) => {
                                debug!("received {:?}", message);
                                if inbound.send(message).is_err() {
                                    break;
                                }
                            }
                            Ok(None) => debug!("ignoring publish on {}", publish.topic),
                            Err(e) => warn!("invalid payload on {}: {}", publish.topic, e),
                        }
                    }
                    Ok(notification) => {
                        debug!("MQTT event: {:?}", notification);
                    }
                    Err(e) => {
                        error!("MQTT event loop error: {:?}", e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(MqttClient {
            client,
            config,
            topics,
        })
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Publish the message and options schemas, retained.
    pub async fn publish_schemas(&self) -> Result<(), rumqttc::ClientError> {
        let schemas = json!({
            "messageSchema": plugin::message_schema(),
            "optionsSchema": plugin::options_schema(),
        });

        info!("Publishing schemas to: {}", self.topics.schema);
        self.client
            .publish(
                self.topics.schema.as_str(),
                QoS::AtLeastOnce,
                true,
                schemas.to_string(),
            )
            .await
    }

    pub async fn publish_event(&self, event: &plugin::Event) -> Result<(), rumqttc::ClientError> {
        let (topic, payload) = match event {
            plugin::Event::Data(data) => (&self.topics.data, data.to_string()),
            plugin::Event::Error(message) => {
                (&self.topics.error, json!({ "error": message }).to_string())
            }
        };

        debug!("Publishing to {}: {}", topic, payload);
        self.client
            .publish(topic.as_str(), QoS::AtMostOnce, false, payload)
            .await
    }
}

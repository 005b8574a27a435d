use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS, SubscribeFilter};
use tokio::sync::mpsc;

use crate::config;
use crate::gateway::GatewayEvent;
use crate::messages::{BusError, BusMessage, MessageBus};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    subscriptions: Vec<String>,
}

impl MqttClient {
    pub fn new(
        config: &config::MqttConfig,
        subscriptions: Vec<String>,
    ) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"table-gateway".to_string())
            .to_string();

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) =
            rumqttc::AsyncClient::new(mqttoptions, config.channel_capacity.unwrap_or(64));

        (
            MqttClient {
                client,
                subscriptions,
            },
            eventloop,
        )
    }

    /// Queue the subscriptions without waiting. The request channel is only
    /// drained by `event_loop`, so this must never block on it.
    pub fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        if self.subscriptions.is_empty() {
            return Ok(());
        }
        self.client.try_subscribe_many(filters(&self.subscriptions))?;

        Ok(())
    }

    /// Poll the connection, forwarding every incoming publish to the gateway.
    /// Returns once the gateway stops listening.
    pub async fn event_loop(
        &self,
        mut eventloop: rumqttc::EventLoop,
        tx: mpsc::UnboundedSender<GatewayEvent>,
    ) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::Publish(p)) => {
                        let message = bus_message(&p);
                        debug!("Received MQTT message on topic {}", message.topic);
                        if tx.send(GatewayEvent::Bus(message)).is_err() {
                            debug!("Gateway stopped, leaving MQTT event loop");
                            return;
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::SubAck(_)) => {
                        debug!("Subscription acknowledged");
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        if let Err(err) = self.subscribe() {
                            error!("Error subscribing to MQTT topics: {:?}", err);
                        }
                    }
                    _ => {}
                },
                Err(e) => {
                    if tx.is_closed() {
                        return;
                    }
                    warn!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

impl MessageBus for MqttClient {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| BusError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }
}

fn filters(topics: &[String]) -> Vec<SubscribeFilter> {
    topics
        .iter()
        .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce))
        .collect()
}

fn bus_message(publish: &rumqttc::Publish) -> BusMessage {
    BusMessage {
        topic: publish.topic.clone(),
        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters() {
        let topics = vec![
            "restaurant/sensors/command".to_string(),
            "restaurant/tables/+/order_ready".to_string(),
        ];
        let filters = filters(&topics);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1].path, "restaurant/tables/+/order_ready");
        assert!(filters.iter().all(|f| f.qos == QoS::AtMostOnce));
    }

    #[test]
    fn test_bus_message() {
        let publish = rumqttc::Publish::new(
            "restaurant/tables/2/order_ready",
            QoS::AtMostOnce,
            "{\"state\":\"on\"}",
        );
        assert_eq!(
            bus_message(&publish),
            BusMessage {
                topic: "restaurant/tables/2/order_ready".to_string(),
                payload: "{\"state\":\"on\"}".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_subscribe_does_not_wait_on_full_request_queue() {
        let config: config::MqttConfig = toml::de::from_str(
            r#"
            host = "localhost"
            channel_capacity = 1
            "#,
        )
        .unwrap();
        let (client, _eventloop) =
            MqttClient::new(&config, vec!["restaurant/sensors/command".to_string()]);
        client
            .publish("restaurant/tables/1/active", "true".to_string())
            .unwrap();

        // Fails at once instead of parking until the event loop drains the queue.
        assert!(client.subscribe().is_err());

        let (empty, _eventloop) = MqttClient::new(&config, Vec::new());
        assert!(empty.subscribe().is_ok());
    }

    #[tokio::test]
    async fn test_publish_fails_once_request_queue_is_full() {
        let config: config::MqttConfig = toml::de::from_str(
            r#"
            host = "localhost"
            channel_capacity = 1
            "#,
        )
        .unwrap();
        let (client, _eventloop) = MqttClient::new(&config, Vec::new());
        assert!(client.publish("restaurant/tables/1/active", "true".to_string()).is_ok());
        let err = client
            .publish("restaurant/tables/1/active", "false".to_string())
            .unwrap_err();
        assert!(err.to_string().contains("restaurant/tables/1/active"));
    }
}

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{config::MqttConfig, error::Result};

/// Requests buffered between the client handle and the event loop
const REQUEST_CAPACITY: usize = 64;

/// Pause before polling again after a connection error
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published to
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

/// Outbound side of the broker connection
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish a payload to a topic
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be handed to the client.
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;
}

/// [`Publisher`] backed by a rumqttc client
#[derive(Clone)]
pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Wrap a rumqttc client
    #[must_use]
    pub const fn new(client: AsyncClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        debug!("Publishing to {}: {}", topic, payload);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Translate the bridge configuration into rumqttc options
#[must_use]
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }

    if config.use_tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    options
}

/// A running broker connection
///
/// The rumqttc event loop is polled on its own task. Subscriptions are
/// (re)issued on every `ConnAck`, so they survive broker reconnects.
/// Incoming publishes are forwarded to [`MqttConnection::inbound`].
pub struct MqttConnection {
    client: AsyncClient,
    inbound: mpsc::UnboundedReceiver<InboundMessage>,
    event_task: JoinHandle<()>,
}

impl MqttConnection {
    /// Start the client and its event loop
    #[must_use]
    pub fn start(config: &MqttConfig, subscriptions: Vec<String>) -> Self {
        info!(
            "Connecting to MQTT broker at {}:{}",
            config.broker_host, config.broker_port
        );

        let (client, event_loop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let event_task = tokio::spawn(drive_event_loop(
            event_loop,
            client.clone(),
            subscriptions,
            inbound_tx,
        ));

        Self {
            client,
            inbound,
            event_task,
        }
    }

    /// Publisher sharing this connection
    #[must_use]
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher::new(self.client.clone())
    }

    /// Receiver of messages on subscribed topics
    pub fn inbound(&mut self) -> &mut mpsc::UnboundedReceiver<InboundMessage> {
        &mut self.inbound
    }

    /// Drop commands that arrived while no trainer was connected
    ///
    /// Returns how many were discarded.
    pub fn discard_pending(&mut self) -> usize {
        drain_inbound(&mut self.inbound)
    }

    /// Disconnect from the broker and stop the event loop
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::MqttClient`](crate::BridgeError::MqttClient)
    /// if the disconnect request cannot be queued.
    pub async fn shutdown(self) -> Result<()> {
        let result = self.client.disconnect().await;
        self.event_task.abort();
        result?;
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}

fn drain_inbound(inbound: &mut mpsc::UnboundedReceiver<InboundMessage>) -> usize {
    let mut discarded = 0;
    while let Ok(message) = inbound.try_recv() {
        debug!("Discarding stale message on {}", message.topic);
        discarded += 1;
    }
    discarded
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    subscriptions: Vec<String>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!("Connected to MQTT broker ({:?})", ack.code);
                for topic in &subscriptions {
                    // try_subscribe: this task is the one draining the request queue
                    match client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        Ok(()) => info!("Subscribed to {}", topic),
                        Err(e) => warn!("Failed to subscribe to {}: {}", topic, e),
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if inbound.send(message).is_err() {
                    debug!("Inbound receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use tokio_test::{assert_err, assert_ok};

    fn config(use_tls: bool) -> MqttConfig {
        MqttConfig {
            broker_host: "broker.example.com".to_string(),
            broker_port: 8883,
            use_tls,
            username: Some("bike".to_string()),
            password: Some("secret".to_string()),
            client_id: "kickr-bridge-000001".to_string(),
            keep_alive_secs: 30,
        }
    }

    #[test]
    fn test_options_from_config() {
        let options = mqtt_options(&config(true));

        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 8883)
        );
        assert_eq!(options.client_id(), "kickr-bridge-000001");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            options.credentials(),
            Some(("bike".to_string(), "secret".to_string()))
        );
        assert!(!matches!(options.transport(), Transport::Tcp));
    }

    #[test]
    fn test_plain_tcp_without_credentials() {
        let mut config = config(false);
        config.username = None;

        let options = mqtt_options(&config);
        assert!(matches!(options.transport(), Transport::Tcp));
        assert_eq!(options.credentials(), None);
    }

    #[test]
    fn test_stale_commands_are_discarded() {
        let (tx, mut inbound) = mpsc::unbounded_channel();
        for payload in ["5", "10"] {
            tx.send(InboundMessage {
                topic: "bike/000001/incline".to_string(),
                payload: Bytes::from_static(payload.as_bytes()),
            })
            .unwrap();
        }

        assert_eq!(drain_inbound(&mut inbound), 2);
        assert_eq!(drain_inbound(&mut inbound), 0);

        // the channel stays open for new commands
        tx.send(InboundMessage {
            topic: "bike/000001/resistance".to_string(),
            payload: Bytes::from_static(b"20"),
        })
        .unwrap();
        assert_eq!(inbound.try_recv().unwrap().payload, Bytes::from_static(b"20"));
    }

    #[tokio::test]
    async fn test_publisher_queues_request() {
        let (client, event_loop) = AsyncClient::new(mqtt_options(&config(false)), 10);
        let publisher = MqttPublisher::new(client);

        assert_ok!(publisher.publish("bike/000001/speed", "{}".to_string()).await);

        drop(event_loop);
        let err = assert_err!(publisher.publish("bike/000001/speed", "{}".to_string()).await);
        assert!(matches!(err, BridgeError::MqttClient(_)));
    }
}

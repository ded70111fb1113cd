//! Broker transport over rumqttc.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::AsyncClient;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::MqttConfig;

const DEFAULT_CLIENT_ID: &str = "hue2mqtt";

/// Message received from a subscription.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    #[allow(dead_code)]
    pub retain: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("mqtt client is not connected")]
    NotConnected,

    #[error("mqtt request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Broker operations the proxy needs; mockable for tests.
#[async_trait]
pub trait MqttClient: Send {
    async fn connect(&mut self) -> Result<(), MqttError>;

    fn is_connected(&self) -> bool;

    async fn subscribe_many(&mut self, topics: &[String]) -> Result<(), MqttError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Non-blocking intake of buffered inbound messages.
    fn drain_messages(&mut self) -> Vec<MqttMessage>;

    async fn disconnect(&mut self);
}

/// Real client implementation using rumqttc.
pub struct RumqttcClient {
    mqtt_options: MqttOptions,
    qos: QoS,

    /// AsyncClient (created in connect())
    client: Option<AsyncClient>,

    /// Message receiver (created in connect())
    message_rx: Option<mpsc::UnboundedReceiver<MqttMessage>>,

    /// Set by the event loop task on ConnAck, cleared on errors
    connected: Arc<AtomicBool>,

    /// Background event loop task handle
    event_loop_task: Option<JoinHandle<()>>,
}

impl RumqttcClient {
    pub fn new(config: &MqttConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        let mut mqtt_options = MqttOptions::new(client_id, config.host.clone(), config.port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keepalive_s));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            mqtt_options.set_credentials(username, password);
        }

        let qos = match config.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        };

        Self {
            mqtt_options,
            qos,
            client: None,
            message_rx: None,
            connected: Arc::new(AtomicBool::new(false)),
            event_loop_task: None,
        }
    }
}

#[async_trait]
impl MqttClient for RumqttcClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        let (client, mut event_loop) = AsyncClient::new(self.mqtt_options.clone(), 10);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let connected = Arc::clone(&self.connected);

        // Background task polling the event loop; inbound publishes are
        // handed to the scheduler through the channel.
        let task = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt broker connected");
                        connected.store(true, Ordering::SeqCst);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let msg = MqttMessage {
                            topic: publish.topic.to_string(),
                            payload: publish.payload.to_vec(),
                            retain: publish.retain,
                        };
                        if message_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt event loop error: {e}");
                        connected.store(false, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            info!("mqtt event loop task exiting");
        });

        self.client = Some(client);
        self.message_rx = Some(message_rx);
        self.event_loop_task = Some(task);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe_many(&mut self, topics: &[String]) -> Result<(), MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::NotConnected)?;
        for topic in topics {
            client.subscribe(topic, self.qos).await?;
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        let client = self.client.as_ref().ok_or(MqttError::NotConnected)?;
        client.publish(topic, self.qos, retain, payload).await?;
        Ok(())
    }

    fn drain_messages(&mut self) -> Vec<MqttMessage> {
        let mut messages = Vec::new();
        if let Some(rx) = &mut self.message_rx {
            while let Ok(message) = rx.try_recv() {
                messages.push(message);
            }
        }
        messages
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for RumqttcClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop_task.take() {
            task.abort();
        }
    }
}

/// Mock client for testing.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockMqttClient {
    pub messages: Vec<MqttMessage>,
    pub subscriptions: Vec<String>,
    pub published: Vec<(String, Vec<u8>, bool)>,
    pub is_connected: bool,
    pub fail_publish: bool,
}

#[cfg(test)]
impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_message(&mut self, topic: &str, payload: &str) {
        self.messages.push(MqttMessage {
            topic: topic.to_string(),
            payload: payload.as_bytes().to_vec(),
            retain: false,
        });
    }
}

#[cfg(test)]
#[async_trait]
impl MqttClient for MockMqttClient {
    async fn connect(&mut self) -> Result<(), MqttError> {
        self.is_connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.is_connected
    }

    async fn subscribe_many(&mut self, topics: &[String]) -> Result<(), MqttError> {
        self.subscriptions.extend(topics.iter().cloned());
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.fail_publish {
            return Err(MqttError::NotConnected);
        }
        self.published
            .push((topic.to_string(), payload.to_vec(), retain));
        Ok(())
    }

    fn drain_messages(&mut self) -> Vec<MqttMessage> {
        std::mem::take(&mut self.messages)
    }

    async fn disconnect(&mut self) {
        self.is_connected = false;
    }
}

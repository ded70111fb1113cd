//! Routes broker messages to things and thing state out to the broker.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::mqtt::client::{MqttClient, MqttError};
use crate::thing::{StateMessage, ThingRegistry};

const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECT_ATTEMPTS: u32 = 100;

pub struct MqttProxy<M> {
    client: M,

    /// Command topic to the hue ids of the things subscribed to it. One
    /// topic may fan out to several things.
    routes: HashMap<String, Vec<String>>,

    /// Pending publishes, drained in FIFO order.
    outgoing: VecDeque<StateMessage>,
}

impl<M: MqttClient> MqttProxy<M> {
    pub fn new(client: M, things: &ThingRegistry) -> Self {
        let mut routes: HashMap<String, Vec<String>> = HashMap::new();
        for thing in things.iter() {
            for topic in thing.subscriptions() {
                routes.entry(topic).or_default().push(thing.hue_id().to_string());
            }
        }
        Self {
            client,
            routes,
            outgoing: VecDeque::new(),
        }
    }

    /// Open the transport, wait for the broker handshake and subscribe to
    /// every command topic.
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        self.client.connect().await?;

        let mut attempts = 0;
        while !self.client.is_connected() {
            attempts += 1;
            if attempts > CONNECT_ATTEMPTS {
                return Err(MqttError::NotConnected);
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }

        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        self.client.subscribe_many(&topics).await
    }

    /// Drain inbound messages and hand each to every thing subscribed to
    /// its topic.
    pub fn process_thing_commands(&mut self, things: &mut ThingRegistry) {
        for message in self.client.drain_messages() {
            let Some(ids) = self.routes.get(&message.topic) else {
                debug!(topic = %message.topic, "message on a topic nothing subscribes to");
                continue;
            };
            let payload = String::from_utf8_lossy(&message.payload).into_owned();
            for id in ids {
                if let Some(thing) = things.get_mut(id) {
                    thing.submit_command(&message.topic, &payload);
                }
            }
        }
    }

    /// Move every thing's buffered state messages into the shared publish
    /// queue. Returns whether anything is pending.
    pub fn fetch_state_changes(&mut self, things: &mut ThingRegistry) -> bool {
        let outgoing = &mut self.outgoing;
        things.for_each_mut(|thing| {
            if let Some(messages) = thing.drain_state_messages() {
                outgoing.extend(messages);
            }
        });
        !self.outgoing.is_empty()
    }

    /// Publish the pending queue in FIFO order. A transport failure leaves
    /// the unsent remainder queued and is reported to the caller.
    pub async fn publish_state_messages(&mut self) -> Result<(), MqttError> {
        while let Some(message) = self.outgoing.pop_front() {
            let payload = message.payload.clone().into_text();
            if let Err(err) = self
                .client
                .publish(&message.topic, payload.as_bytes(), message.retain)
                .await
            {
                self.outgoing.push_front(message);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Periodic housekeeping between publishes.
    pub fn process_timer(&mut self) {
        if !self.client.is_connected() {
            warn!("mqtt broker connection is down");
        }
    }

    /// Close every thing (buffering configured last wills) and flush. Runs
    /// on every shutdown path; failures are logged, never propagated.
    pub async fn publish_last_wills(&mut self, things: &mut ThingRegistry) {
        things.close_all();
        self.fetch_state_changes(things);
        while let Some(message) = self.outgoing.pop_front() {
            let payload = message.payload.clone().into_text();
            if let Err(err) = self
                .client
                .publish(&message.topic, payload.as_bytes(), message.retain)
                .await
            {
                warn!(topic = %message.topic, "last will publish failed: {err}");
            }
        }
    }

    pub async fn disconnect(&mut self) {
        self.client.disconnect().await;
    }

    #[cfg(test)]
    pub fn client_mut(&mut self) -> &mut M {
        &mut self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::client::MockMqttClient;
    use crate::thing::Thing;

    fn registry() -> ThingRegistry {
        let mut things = ThingRegistry::new();
        things
            .register(
                Thing::new("hue-1", "One")
                    .with_cmd_topic("home/shared/cmd")
                    .with_state_topic("home/one/state")
                    .with_last_will("offline"),
            )
            .unwrap();
        things
            .register(
                Thing::new("hue-2", "Two")
                    .with_cmd_topic("home/shared/cmd")
                    .with_state_topic("home/two/state")
                    .with_last_will("offline"),
            )
            .unwrap();
        things
            .register(
                Thing::new("hue-3", "Three")
                    .with_cmd_topic("home/three/cmd")
                    .with_state_topic("home/three/state"),
            )
            .unwrap();
        things
    }

    #[tokio::test]
    async fn connect_subscribes_to_the_full_topic_set() {
        let things = registry();
        let mut proxy = MqttProxy::new(MockMqttClient::new(), &things);
        proxy.connect().await.unwrap();
        assert_eq!(
            proxy.client.subscriptions,
            vec!["home/shared/cmd".to_string(), "home/three/cmd".to_string()]
        );
    }

    #[tokio::test]
    async fn shared_topic_fans_out_to_every_subscriber() {
        let mut things = registry();
        let mut client = MockMqttClient::new();
        client.add_message("home/shared/cmd", "on");
        client.add_message("home/unknown", "on");
        let mut proxy = MqttProxy::new(client, &things);

        proxy.process_thing_commands(&mut things);

        assert!(things.get_mut("hue-1").unwrap().take_command().is_some());
        assert!(things.get_mut("hue-2").unwrap().take_command().is_some());
        assert!(things.get_mut("hue-3").unwrap().take_command().is_none());
    }

    #[tokio::test]
    async fn state_messages_publish_in_fifo_order() {
        let mut things = registry();
        let mut proxy = MqttProxy::new(MockMqttClient::new(), &things);

        things
            .get_mut("hue-1")
            .unwrap()
            .record_state(&crate::thing::ThingEvent {
                status: Some(crate::thing::ThingStatus::On),
                ..Default::default()
            });
        things
            .get_mut("hue-2")
            .unwrap()
            .record_state(&crate::thing::ThingEvent {
                status: Some(crate::thing::ThingStatus::Off),
                ..Default::default()
            });

        assert!(proxy.fetch_state_changes(&mut things));
        proxy.publish_state_messages().await.unwrap();

        let published = &proxy.client.published;
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "home/one/state");
        assert_eq!(published[1].0, "home/two/state");

        // Canonical JSON with sorted keys, status first field after name.
        let text = String::from_utf8(published[0].1.clone()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["status"], "on");

        assert!(!proxy.fetch_state_changes(&mut things));
    }

    #[tokio::test]
    async fn failed_publish_keeps_the_remainder_queued() {
        let mut things = registry();
        let mut proxy = MqttProxy::new(MockMqttClient::new(), &things);
        proxy.client.fail_publish = true;

        things
            .get_mut("hue-1")
            .unwrap()
            .record_state(&crate::thing::ThingEvent::default());
        proxy.fetch_state_changes(&mut things);
        assert!(proxy.publish_state_messages().await.is_err());
        assert_eq!(proxy.outgoing.len(), 1);
    }

    #[tokio::test]
    async fn last_wills_publish_exactly_once() {
        let mut things = registry();
        let mut proxy = MqttProxy::new(MockMqttClient::new(), &things);

        proxy.publish_last_wills(&mut things).await;
        proxy.publish_last_wills(&mut things).await;

        // Only the two things with a configured last will publish one.
        assert_eq!(proxy.client.published.len(), 2);
        assert_eq!(proxy.client.published[0].0, "home/one/state");
        assert_eq!(
            String::from_utf8(proxy.client.published[0].1.clone()).unwrap(),
            "offline"
        );
    }
}

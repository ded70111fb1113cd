//! MQTT integration: the broker transport and the proxy routing messages
//! between broker topics and things.

pub mod client;
pub mod proxy;

pub use client::{MqttClient, MqttError, MqttMessage, RumqttcClient};
pub use proxy::MqttProxy;

//! Hue bridge integration: typed CLIP v2 model, event normalization, the
//! HTTP/eventstream client and the aggregating connector.

pub mod client;
pub mod connector;
pub mod event;
pub mod model;

pub use client::{ClipClient, HueClient, HueError, HueStreamEvent};
pub use connector::HueConnector;
pub use model::{FullState, HueEventType, HueItem};

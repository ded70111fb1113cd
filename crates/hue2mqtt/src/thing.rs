//! Things: the configured logical units (a single light or a room/zone) with
//! their MQTT topics, outgoing state buffer and single-slot command mailbox.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{Local, SecondsFormat};
use serde_json::json;
use tracing::warn;

use crate::command::HueCommand;
use crate::config::{expand_topic, AppConfig, ConfigError, ThingConfig, ThingDefaults};

pub const DEFAULT_STATE_DEBOUNCE: Duration = Duration::from_millis(300);
pub const DEFAULT_MIN_BRIGHTNESS: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Text(String),
    Json(serde_json::Value),
}

impl MessagePayload {
    /// Canonical wire form. JSON objects serialize with sorted keys.
    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Json(value) => value.to_string(),
        }
    }
}

/// A not-yet-published MQTT state message.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    pub topic: String,
    pub payload: MessagePayload,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThingStatus {
    On,
    Off,
    Offline,
    /// Unable to determine the state; not a hard failure.
    Error,
}

impl ThingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }
}

/// A normalized state event, produced by the Hue event converter and
/// serialized into the thing's state topic payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThingEvent {
    pub status: Option<ThingStatus>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub kind: Option<String>,
    pub brightness: Option<f64>,
}

pub struct Thing {
    hue_id: String,
    name: String,
    cmd_topic: Option<String>,
    state_topic: Option<String>,
    last_will: Option<String>,
    retain: bool,
    min_brightness: f64,
    state_debounce: Duration,

    messages: Vec<StateMessage>,
    pending_command: Option<HueCommand>,
    closed: bool,
}

impl Thing {
    pub fn new(hue_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            hue_id: hue_id.into(),
            name: name.into(),
            cmd_topic: None,
            state_topic: None,
            last_will: None,
            retain: false,
            min_brightness: DEFAULT_MIN_BRIGHTNESS,
            state_debounce: DEFAULT_STATE_DEBOUNCE,
            messages: Vec::new(),
            pending_command: None,
            closed: false,
        }
    }

    pub fn with_cmd_topic(mut self, topic: impl Into<String>) -> Self {
        self.cmd_topic = Some(topic.into());
        self
    }

    pub fn with_state_topic(mut self, topic: impl Into<String>) -> Self {
        self.state_topic = Some(topic.into());
        self
    }

    pub fn with_last_will(mut self, payload: impl Into<String>) -> Self {
        self.last_will = Some(payload.into());
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_min_brightness(mut self, min_brightness: f64) -> Self {
        self.min_brightness = min_brightness;
        self
    }

    pub fn with_state_debounce(mut self, quiet: Duration) -> Self {
        self.state_debounce = quiet;
        self
    }

    pub fn hue_id(&self) -> &str {
        &self.hue_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_brightness(&self) -> f64 {
        self.min_brightness
    }

    pub fn state_debounce(&self) -> Duration {
        self.state_debounce
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// MQTT topics this thing listens on.
    pub fn subscriptions(&self) -> Vec<String> {
        self.cmd_topic.iter().cloned().collect()
    }

    /// Parse an incoming MQTT payload and store it in the single-slot
    /// mailbox. A newer command overwrites an older pending one; only the
    /// latest takes effect. Unparseable payloads are logged and dropped.
    pub fn submit_command(&mut self, _topic: &str, payload: &str) {
        if self.closed {
            return;
        }

        match HueCommand::parse(payload) {
            Ok(command) => {
                if let Some(previous) = self.pending_command {
                    warn!(
                        thing = %self.name,
                        "overwriting queued command ({previous}) with new one ({command})"
                    );
                }
                self.pending_command = Some(command);
            }
            Err(err) => warn!(thing = %self.name, "{err}"),
        }
    }

    /// Return and clear the pending command.
    pub fn take_command(&mut self) -> Option<HueCommand> {
        self.pending_command.take()
    }

    /// Serialize a normalized event into the outgoing state buffer.
    pub fn record_state(&mut self, event: &ThingEvent) {
        if self.closed {
            return;
        }
        let Some(topic) = &self.state_topic else {
            return;
        };

        self.messages.push(StateMessage {
            topic: topic.clone(),
            payload: MessagePayload::Json(self.event_payload(event)),
            retain: self.retain,
        });
    }

    /// Build the published JSON object: `name`, `status` (default "error"),
    /// `brightness` only when present (rounded to nearest integer), and a
    /// second-precision `timestamp`. Absent fields are omitted, never null.
    fn event_payload(&self, event: &ThingEvent) -> serde_json::Value {
        let mut payload = serde_json::Map::new();
        payload.insert("name".to_string(), json!(self.name));
        payload.insert(
            "status".to_string(),
            json!(event.status.unwrap_or(ThingStatus::Error).as_str()),
        );
        if let Some(brightness) = event.brightness {
            payload.insert("brightness".to_string(), json!(brightness.round() as i64));
        }
        payload.insert(
            "timestamp".to_string(),
            json!(Local::now().to_rfc3339_opts(SecondsFormat::Secs, false)),
        );
        serde_json::Value::Object(payload)
    }

    /// Return and clear the outgoing buffer, or `None` if nothing is
    /// pending.
    pub fn drain_state_messages(&mut self) -> Option<Vec<StateMessage>> {
        if self.messages.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.messages))
        }
    }

    /// Buffer the last-will payload (if configured) and mark the thing
    /// closed. Idempotent: a second close is a no-op.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let (Some(topic), Some(will)) = (&self.state_topic, &self.last_will) {
            self.messages.push(StateMessage {
                topic: topic.clone(),
                payload: MessagePayload::Text(will.clone()),
                retain: self.retain,
            });
        }
        self.closed = true;
    }

    /// Resume service after a rebuild found the backing item again.
    pub fn reopen(&mut self) {
        self.closed = false;
    }
}

/// Ordered, owned collection of things keyed by hue id.
///
/// All mutation happens on the scheduler; the registry is passed by mutable
/// reference into the connector and the MQTT proxy.
#[derive(Default)]
pub struct ThingRegistry {
    order: Vec<String>,
    things: HashMap<String, Thing>,
}

impl ThingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::new();
        for (name, thing_config) in &config.things {
            let thing = build_thing(name, thing_config, &config.thing_defaults)?;
            registry.register(thing)?;
        }
        Ok(registry)
    }

    /// Duplicate hue ids are a fatal configuration error.
    pub fn register(&mut self, thing: Thing) -> Result<(), ConfigError> {
        let hue_id = thing.hue_id().to_string();
        if self.things.contains_key(&hue_id) {
            return Err(ConfigError::Invalid(format!(
                "duplicate hue id in thing configuration ({hue_id})"
            )));
        }
        self.order.push(hue_id.clone());
        self.things.insert(hue_id, thing);
        Ok(())
    }

    pub fn get(&self, hue_id: &str) -> Option<&Thing> {
        self.things.get(hue_id)
    }

    pub fn get_mut(&mut self, hue_id: &str) -> Option<&mut Thing> {
        self.things.get_mut(hue_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Thing> {
        self.order.iter().filter_map(|id| self.things.get(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn for_each_mut(&mut self, mut f: impl FnMut(&mut Thing)) {
        for id in &self.order {
            if let Some(thing) = self.things.get_mut(id) {
                f(thing);
            }
        }
    }

    pub fn close_all(&mut self) {
        self.for_each_mut(Thing::close);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

fn build_thing(
    name: &str,
    config: &ThingConfig,
    defaults: &ThingDefaults,
) -> Result<Thing, ConfigError> {
    let cmd_topic = config.cmd_topic.clone().or_else(|| {
        defaults
            .cmd_topic
            .as_ref()
            .map(|template| expand_topic(template, name))
    });
    let state_topic = config.state_topic.clone().or_else(|| {
        defaults
            .state_topic
            .as_ref()
            .map(|template| expand_topic(template, name))
    });

    if cmd_topic.is_none() && state_topic.is_none() {
        return Err(ConfigError::Invalid(format!(
            "thing '{name}' has no MQTT topics"
        )));
    }

    let mut thing = Thing::new(&config.hue_id, name)
        .with_retain(config.retain.or(defaults.retain).unwrap_or(false))
        .with_min_brightness(
            config
                .min_brightness
                .or(defaults.min_brightness)
                .unwrap_or(DEFAULT_MIN_BRIGHTNESS),
        )
        .with_state_debounce(Duration::from_millis(
            config
                .state_debounce_ms
                .or(defaults.state_debounce_ms)
                .unwrap_or(DEFAULT_STATE_DEBOUNCE.as_millis() as u64),
        ));

    if let Some(topic) = cmd_topic {
        thing = thing.with_cmd_topic(topic);
    }
    if let Some(topic) = state_topic {
        thing = thing.with_state_topic(topic);
    }
    if let Some(will) = config.last_will.clone().or_else(|| defaults.last_will.clone()) {
        thing = thing.with_last_will(will);
    }

    Ok(thing)
}

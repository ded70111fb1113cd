//! The aggregation engine: owns the vendor item cache and group topology,
//! coalesces bursts of child-light updates into single group events, and
//! translates queued commands into vendor API calls.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::{HueCommand, SwitchPosition};
use crate::config::HueBridgeConfig;
use crate::debounce::DebounceMap;
use crate::hue::client::{HueClient, HueError, HueStreamEvent};
use crate::hue::event::to_thing_event;
use crate::hue::model::{FullState, Group, HueEventType, HueItem};
use crate::thing::{Thing, ThingEvent, ThingRegistry, ThingStatus, DEFAULT_MIN_BRIGHTNESS};

pub struct HueConnector<C> {
    client: C,
    group_quiet: Duration,
    refresh_interval: Duration,
    next_refresh: Instant,

    /// Last-seen snapshot of every item the bridge has told us about.
    items: HashMap<String, HueItem>,

    // Topology, recomputed wholesale at every rebuild.
    grouped_light_to_group: HashMap<String, String>,
    light_to_group: HashMap<String, String>,
    group_children: HashMap<String, Vec<String>>,

    group_debounce: DebounceMap<String, ()>,
    state_debounce: DebounceMap<String, ThingEvent>,

    commands: VecDeque<(String, HueCommand)>,
}

impl<C: HueClient> HueConnector<C> {
    pub fn new(client: C, config: &HueBridgeConfig) -> Self {
        Self {
            client,
            group_quiet: Duration::from_millis(config.group_debounce_ms),
            refresh_interval: Duration::from_secs(config.refresh_interval_s),
            next_refresh: Instant::now(),
            items: HashMap::new(),
            grouped_light_to_group: HashMap::new(),
            light_to_group: HashMap::new(),
            group_children: HashMap::new(),
            group_debounce: DebounceMap::new(),
            state_debounce: DebounceMap::new(),
            commands: VecDeque::new(),
        }
    }

    /// Establish the vendor session and perform the initial full rebuild.
    pub async fn connect(&mut self, things: &mut ThingRegistry) -> Result<(), HueError> {
        self.client.connect().await?;
        self.refresh(things).await
    }

    #[cfg(test)]
    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub async fn close(&mut self) {
        self.client.close().await;
        self.items.clear();
        self.grouped_light_to_group.clear();
        self.light_to_group.clear();
        self.group_children.clear();
        self.group_debounce.clear();
        self.state_debounce.clear();
    }

    /// Periodic housekeeping; runs the full refresh when its interval has
    /// elapsed.
    pub async fn process_timer(&mut self, things: &mut ThingRegistry) -> Result<(), HueError> {
        if Instant::now() >= self.next_refresh {
            info!("full refresh");
            self.refresh(things).await?;
        }
        Ok(())
    }

    async fn refresh(&mut self, things: &mut ThingRegistry) -> Result<(), HueError> {
        self.next_refresh = Instant::now() + self.refresh_interval;
        let state = self.client.fetch_full_state().await?;
        self.rebuild(state, things);
        Ok(())
    }

    /// Tear down caches and topology, then re-derive everything from a
    /// fresh snapshot. Cached state is finally re-fed through the normal
    /// event handler so the initial state of every thing is observed.
    fn rebuild(&mut self, state: FullState, things: &mut ThingRegistry) {
        self.items.clear();
        self.grouped_light_to_group.clear();
        self.light_to_group.clear();
        self.group_children.clear();
        self.group_debounce.clear();
        self.state_debounce.clear();

        for device in &state.devices {
            self.items.insert(device.id().to_string(), device.clone());
        }
        for light in &state.lights {
            self.handle_state_changed(HueEventType::Update, light.clone(), things);
        }

        for item in state.rooms.iter().chain(&state.zones) {
            let Some(group) = item.as_group() else { continue };
            self.items.insert(group.id.clone(), item.clone());
            if things.get(&group.id).is_some() {
                self.rebuild_group_topology(group);
            }
        }

        self.reconcile_things(things);

        for grouped in &state.grouped_lights {
            self.handle_state_changed(HueEventType::Update, grouped.clone(), things);
        }
        for item in state.rooms.iter().chain(&state.zones) {
            self.handle_state_changed(HueEventType::Update, item.clone(), things);
        }
    }

    fn rebuild_group_topology(&mut self, group: &Group) {
        match group.grouped_light_service() {
            Some(grouped_id) => {
                self.grouped_light_to_group
                    .insert(grouped_id.to_string(), group.id.clone());
            }
            None => warn!(group = %group.id, "group has no grouped_light service"),
        }

        // Room children are device links, zone children are light links.
        let mut members = Vec::new();
        for child in &group.children {
            match child.rtype.as_str() {
                "light" => members.push(child.rid.clone()),
                "device" => {
                    if let Some(device) = self.items.get(&child.rid).and_then(HueItem::as_device) {
                        members.extend(device.light_services().map(str::to_string));
                    }
                }
                _ => {}
            }
        }
        if members.is_empty() {
            warn!(group = %group.id, "no resolvable member lights");
        }
        for member in &members {
            self.light_to_group.insert(member.clone(), group.id.clone());
        }
        self.group_children.insert(group.id.clone(), members);
    }

    /// Disable things whose backing item is gone or of an unserviceable
    /// kind; re-enable things a previous rebuild had disabled.
    fn reconcile_things(&self, things: &mut ThingRegistry) {
        let items = &self.items;
        things.for_each_mut(|thing| match items.get(thing.hue_id()) {
            Some(HueItem::Light(_)) | Some(HueItem::Room(_)) | Some(HueItem::Zone(_)) => {
                thing.reopen();
            }
            Some(other) => {
                if !thing.is_closed() {
                    warn!(
                        thing = %thing.name(),
                        kind = other.kind(),
                        "item kind cannot be serviced, disabling"
                    );
                }
                thing.close();
            }
            None => {
                if !thing.is_closed() {
                    warn!(
                        thing = %thing.name(),
                        id = %thing.hue_id(),
                        "item not found on bridge, disabling"
                    );
                }
                thing.close();
            }
        });
    }

    /// Drain push events buffered by the client's stream task.
    pub fn poll(&mut self, things: &mut ThingRegistry) {
        for event in self.client.drain_events() {
            match event {
                HueStreamEvent::Resource(event_type, item) => {
                    self.handle_state_changed(event_type, item, things);
                }
                HueStreamEvent::Disconnected => self.handle_stream_disconnect(things),
            }
        }
    }

    /// The push stream dropped. Every serviced thing goes offline; the
    /// group debounce stage is skipped, a pending group key would replay
    /// stale cached state over the offline events once it expired.
    fn handle_stream_disconnect(&mut self, things: &mut ThingRegistry) {
        warn!("hue event stream dropped, reporting things offline");
        let ids: Vec<String> = things.ids().map(str::to_string).collect();
        for id in ids {
            let Some(item) = self.items.get(&id).cloned() else {
                continue;
            };
            let Some(thing) = things.get(&id) else {
                continue;
            };
            let name = thing.name().to_string();
            let quiet = thing.state_debounce();
            let event = match item.as_group() {
                Some(group) => self.group_event(HueEventType::Disconnected, group, &name),
                None => to_thing_event(HueEventType::Disconnected, &item, Some(&name)),
            };
            self.state_debounce.signal(id, event, quiet);
        }
        self.group_debounce.clear();
    }

    /// The single entry point for state changes, pushed or re-fed.
    ///
    /// Always refreshes the cache. Grouped-light updates only restart the
    /// owning group's debounce; light updates additionally flow to a
    /// directly-configured thing. Group events are delivered when the
    /// group debounce expires and the cached group item lands back here.
    fn handle_state_changed(
        &mut self,
        event_type: HueEventType,
        item: HueItem,
        things: &mut ThingRegistry,
    ) {
        let id = item.id().to_string();
        if id.is_empty() {
            return;
        }
        self.items.insert(id.clone(), item.clone());

        match &item {
            HueItem::GroupedLight(_) => {
                if let Some(group_id) = self.grouped_light_to_group.get(&id).cloned() {
                    self.group_debounce.signal(group_id, (), self.group_quiet);
                }
                return;
            }
            HueItem::Light(_) => {
                if let Some(group_id) = self.light_to_group.get(&id).cloned() {
                    self.group_debounce.signal(group_id, (), self.group_quiet);
                }
            }
            _ => {}
        }

        let Some(thing) = things.get(&id) else {
            return;
        };
        let name = thing.name().to_string();
        let quiet = thing.state_debounce();

        let event = match item.as_group() {
            Some(group) => self.group_event(event_type, group, &name),
            None => to_thing_event(event_type, &item, Some(&name)),
        };
        self.state_debounce.signal(id, event, quiet);
    }

    /// Build a group event: on/off comes from the cached grouped_light
    /// child, identity from the group, brightness from the aggregate.
    fn group_event(&self, event_type: HueEventType, group: &Group, name: &str) -> ThingEvent {
        let grouped = group
            .grouped_light_service()
            .and_then(|grouped_id| self.items.get(grouped_id));

        let mut event = match grouped {
            Some(grouped) => to_thing_event(event_type, grouped, Some(name)),
            None => ThingEvent {
                name: Some(name.to_string()),
                kind: Some("group".to_string()),
                ..Default::default()
            },
        };
        event.id = Some(group.id.clone());
        if event.status != Some(ThingStatus::Offline) {
            event.brightness = self.average_brightness(&group.id);
        }
        event
    }

    /// Mean over all cached member lights. Dimmable members contribute
    /// their brightness while on, else 0; non-dimmable members contribute
    /// 100/0. Without any dimmable member there is no meaningful value.
    fn average_brightness(&self, group_id: &str) -> Option<f64> {
        let members = self.group_children.get(group_id)?;

        let mut counted = 0usize;
        let mut dimmable = 0usize;
        let mut sum = 0.0f64;

        for member in members {
            let Some(HueItem::Light(light)) = self.items.get(member) else {
                continue;
            };
            counted += 1;
            let is_on = light.on.map(|on| on.on).unwrap_or(false);
            match light.dimming {
                Some(dimming) => {
                    dimmable += 1;
                    if is_on {
                        sum += dimming.brightness;
                    }
                }
                None => {
                    if is_on {
                        sum += 100.0;
                    }
                }
            }
        }

        if dimmable == 0 || counted == 0 {
            return None;
        }
        Some(sum / counted as f64)
    }

    /// Deliver everything whose quiet period has elapsed. Expired group
    /// keys re-feed the cached group item through the event handler;
    /// expired thing keys hand the buffered event to the thing.
    pub fn flush_due(&mut self, now: Instant, things: &mut ThingRegistry) {
        for (group_id, ()) in self.group_debounce.take_due(now) {
            if let Some(item) = self.items.get(&group_id).cloned() {
                self.handle_state_changed(HueEventType::Update, item, things);
            }
        }
        for (thing_id, event) in self.state_debounce.take_due(now) {
            if let Some(thing) = things.get_mut(&thing_id) {
                thing.record_state(&event);
            }
        }
    }

    /// Move every pending thing command into the work queue. Returns
    /// whether anything is queued for sending.
    pub fn fetch_commands(&mut self, things: &mut ThingRegistry) -> bool {
        let ids: Vec<String> = things.ids().map(str::to_string).collect();
        for id in ids {
            if let Some(command) = things.get_mut(&id).and_then(Thing::take_command) {
                self.commands.push_back((id, command));
            }
        }
        !self.commands.is_empty()
    }

    /// Drain the work queue. A failed command is logged and the queue
    /// continues with the next one.
    pub async fn send_commands(&mut self, things: &ThingRegistry) {
        while let Some((id, command)) = self.commands.pop_front() {
            if let Err(err) = self.send_command(&id, command, things).await {
                let name = things.get(&id).map(Thing::name).unwrap_or(id.as_str());
                warn!(thing = %name, %command, "command failed: {err}");
            }
        }
    }

    async fn send_command(
        &mut self,
        id: &str,
        command: HueCommand,
        things: &ThingRegistry,
    ) -> Result<(), HueError> {
        let Some(item) = self.items.get(id).cloned() else {
            debug!(%id, "dropping command for an item not in the cache");
            return Ok(());
        };

        // Toggle resolves against the controlling item: the grouped_light
        // child for a group, the light itself otherwise.
        let command = match command {
            HueCommand::Switch(SwitchPosition::Toggle) => {
                let controlling_on = match item.as_group() {
                    Some(group) => group
                        .grouped_light_service()
                        .and_then(|grouped_id| self.items.get(grouped_id))
                        .and_then(HueItem::on),
                    None => item.on(),
                };
                let Some(on) = controlling_on else {
                    return Err(HueError::Api("toggle target has no readable on state".into()));
                };
                HueCommand::Switch(if on.on {
                    SwitchPosition::Off
                } else {
                    SwitchPosition::On
                })
            }
            other => other,
        };

        match &item {
            HueItem::Room(group) | HueItem::Zone(group) => {
                let members = self.group_children.get(&group.id).cloned().unwrap_or_default();
                for member in members {
                    // A failing member must not cost the rest of the group
                    // their command.
                    if let Err(err) = self.apply_to_light(&member, command, things).await {
                        warn!(light = %member, %command, "command to group member failed: {err}");
                    }
                }
                Ok(())
            }
            _ => self.apply_to_light(id, command, things).await,
        }
    }

    /// One vendor call per light. The effective dim floor is the larger of
    /// the light's own configured minimum and its hardware minimum; a dim
    /// below it becomes switch-off, a dim to a non-dimmable light becomes
    /// switch-on.
    async fn apply_to_light(
        &mut self,
        light_id: &str,
        command: HueCommand,
        things: &ThingRegistry,
    ) -> Result<(), HueError> {
        let thing_min = things
            .get(light_id)
            .map(Thing::min_brightness)
            .unwrap_or(DEFAULT_MIN_BRIGHTNESS);
        let dimming = self.items.get(light_id).and_then(HueItem::dimming);
        let floor = dimming
            .and_then(|dimming| dimming.min_dim_level)
            .map_or(thing_min, |hw_min| hw_min.max(thing_min));

        match command {
            HueCommand::Switch(position) => {
                let on = matches!(position, SwitchPosition::On);
                self.client.set_light(light_id, Some(on), None).await
            }
            HueCommand::Dim(level) => {
                let level = f64::from(level);
                if level < floor {
                    self.client.set_light(light_id, Some(false), None).await
                } else if dimming.is_none() {
                    self.client.set_light(light_id, Some(true), None).await
                } else {
                    self.client.set_light(light_id, Some(true), Some(level)).await
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hue::client::MockHueClient;
    use crate::thing::{MessagePayload, StateMessage};
    use serde_json::json;

    fn bridge_config() -> HueBridgeConfig {
        serde_yaml::from_str("host: bridge\napp_key: key").unwrap()
    }

    fn item(value: serde_json::Value) -> HueItem {
        serde_json::from_value(value).unwrap()
    }

    fn light(id: &str, on: bool, brightness: Option<f64>) -> HueItem {
        let mut value = json!({
            "type": "light",
            "id": id,
            "metadata": {"name": id},
            "on": {"on": on},
            "owner": {"rid": format!("device-{id}"), "rtype": "device"},
        });
        if let Some(brightness) = brightness {
            value["dimming"] = json!({"brightness": brightness});
        }
        item(value)
    }

    fn device(id: &str, light_ids: &[&str]) -> HueItem {
        let services: Vec<_> = light_ids
            .iter()
            .map(|light_id| json!({"rid": light_id, "rtype": "light"}))
            .collect();
        item(json!({
            "type": "device",
            "id": id,
            "metadata": {"name": id},
            "services": services,
        }))
    }

    fn room(id: &str, grouped_id: &str, device_ids: &[&str]) -> HueItem {
        let children: Vec<_> = device_ids
            .iter()
            .map(|device_id| json!({"rid": device_id, "rtype": "device"}))
            .collect();
        item(json!({
            "type": "room",
            "id": id,
            "metadata": {"name": id},
            "children": children,
            "services": [{"rid": grouped_id, "rtype": "grouped_light"}],
        }))
    }

    fn grouped_light(id: &str, on: bool) -> HueItem {
        item(json!({
            "type": "grouped_light",
            "id": id,
            "on": {"on": on},
        }))
    }

    /// Two dimmable lights in one room, everything configured as things.
    fn room_state(light_1: HueItem, light_2: HueItem) -> FullState {
        FullState {
            devices: vec![device("device-a", &["light-1"]), device("device-b", &["light-2"])],
            lights: vec![light_1, light_2],
            rooms: vec![room("room-1", "grouped-1", &["device-a", "device-b"])],
            zones: vec![],
            grouped_lights: vec![grouped_light("grouped-1", false)],
        }
    }

    fn registry_for_room() -> ThingRegistry {
        let mut things = ThingRegistry::new();
        things
            .register(
                Thing::new("light-1", "Light One")
                    .with_cmd_topic("cmd/light1")
                    .with_state_topic("state/light1"),
            )
            .unwrap();
        things
            .register(
                Thing::new("light-2", "Light Two")
                    .with_cmd_topic("cmd/light2")
                    .with_state_topic("state/light2"),
            )
            .unwrap();
        things
            .register(
                Thing::new("room-1", "Living Room")
                    .with_cmd_topic("cmd/room")
                    .with_state_topic("state/room"),
            )
            .unwrap();
        things
    }

    async fn connected(
        state: FullState,
        things: &mut ThingRegistry,
    ) -> HueConnector<MockHueClient> {
        let mut connector = HueConnector::new(MockHueClient::new(state), &bridge_config());
        connector.connect(things).await.unwrap();
        // Settle and discard the initial snapshot messages.
        flush_all(&mut connector, things);
        things.for_each_mut(|thing| {
            thing.drain_state_messages();
        });
        connector
    }

    /// Force both debounce stages past their deadlines.
    fn flush_all(connector: &mut HueConnector<MockHueClient>, things: &mut ThingRegistry) {
        let far = Instant::now() + Duration::from_secs(60);
        connector.flush_due(far, things);
        let farther = Instant::now() + Duration::from_secs(120);
        connector.flush_due(farther, things);
    }

    fn json_payload(message: &StateMessage) -> serde_json::Value {
        match &message.payload {
            MessagePayload::Json(value) => value.clone(),
            MessagePayload::Text(text) => panic!("expected JSON payload, got {text}"),
        }
    }

    #[tokio::test]
    async fn rebuild_disables_missing_and_unsupported_things() {
        let mut things = ThingRegistry::new();
        things
            .register(Thing::new("light-1", "Light").with_state_topic("state/light"))
            .unwrap();
        things
            .register(
                Thing::new("grouped-1", "Bare Group")
                    .with_state_topic("state/bare")
                    .with_last_will("gone"),
            )
            .unwrap();
        things
            .register(
                Thing::new("ghost", "Ghost")
                    .with_state_topic("state/ghost")
                    .with_last_will("gone"),
            )
            .unwrap();

        let state = FullState {
            lights: vec![light("light-1", true, Some(40.0))],
            grouped_lights: vec![grouped_light("grouped-1", true)],
            ..Default::default()
        };
        let mut connector = HueConnector::new(MockHueClient::new(state), &bridge_config());
        connector.connect(&mut things).await.unwrap();

        assert!(!things.get("light-1").unwrap().is_closed());
        assert!(things.get("grouped-1").unwrap().is_closed());
        assert!(things.get("ghost").unwrap().is_closed());

        // Disabled things emitted their last wills.
        let wills = things.get_mut("ghost").unwrap().drain_state_messages().unwrap();
        assert_eq!(wills[0].payload, MessagePayload::Text("gone".to_string()));
    }

    #[tokio::test]
    async fn rebuild_reopens_a_thing_that_reappears() {
        let mut things = ThingRegistry::new();
        things
            .register(Thing::new("light-1", "Light").with_state_topic("state/light"))
            .unwrap();

        let mut connector = HueConnector::new(
            MockHueClient::new(FullState::default()),
            &bridge_config(),
        );
        connector.connect(&mut things).await.unwrap();
        assert!(things.get("light-1").unwrap().is_closed());

        connector.client.state = FullState {
            lights: vec![light("light-1", false, None)],
            ..Default::default()
        };
        connector.next_refresh = Instant::now();
        connector.process_timer(&mut things).await.unwrap();
        assert!(!things.get("light-1").unwrap().is_closed());
    }

    #[tokio::test]
    async fn burst_of_child_updates_yields_one_group_event() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", false, Some(0.0)), light("light-2", false, Some(0.0))),
            &mut things,
        )
        .await;

        // Five rapid-fire updates for the same room's children.
        for brightness in [10.0, 20.0, 30.0, 40.0, 50.0] {
            connector.client.events.push(HueStreamEvent::Resource(
                HueEventType::Update,
                light("light-1", true, Some(brightness)),
            ));
        }
        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            grouped_light("grouped-1", true),
        ));
        connector.poll(&mut things);
        flush_all(&mut connector, &mut things);

        let messages = things.get_mut("room-1").unwrap().drain_state_messages().unwrap();
        assert_eq!(messages.len(), 1, "burst must coalesce into one event");
        let payload = json_payload(&messages[0]);
        assert_eq!(payload["status"], "on");
        // Mean of 50 (last update, on) and 0 (off).
        assert_eq!(payload["brightness"], 25);
    }

    #[tokio::test]
    async fn aggregate_brightness_follows_the_mixed_member_rules() {
        let mut things = registry_for_room();
        let state = FullState {
            devices: vec![device("device-a", &["light-1"]), device("device-b", &["light-2"])],
            lights: vec![light("light-1", true, Some(80.0)), light("light-2", true, None)],
            rooms: vec![room("room-1", "grouped-1", &["device-a", "device-b"])],
            zones: vec![],
            grouped_lights: vec![grouped_light("grouped-1", true)],
        };
        let connector = connected(state, &mut things).await;

        // One dimmable at 80, one non-dimmable on (counts as 100).
        assert_eq!(connector.average_brightness("room-1"), Some(90.0));
    }

    #[tokio::test]
    async fn aggregate_brightness_is_absent_without_dimmable_members() {
        let mut things = registry_for_room();
        let state = FullState {
            devices: vec![device("device-a", &["light-1"]), device("device-b", &["light-2"])],
            lights: vec![light("light-1", true, None), light("light-2", false, None)],
            rooms: vec![room("room-1", "grouped-1", &["device-a", "device-b"])],
            zones: vec![],
            grouped_lights: vec![grouped_light("grouped-1", true)],
        };
        let connector = connected(state, &mut things).await;

        assert_eq!(connector.average_brightness("room-1"), None);
    }

    #[tokio::test]
    async fn toggle_on_a_lit_room_switches_every_member_off() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", true, Some(50.0)), light("light-2", true, Some(50.0))),
            &mut things,
        )
        .await;
        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            grouped_light("grouped-1", true),
        ));
        connector.poll(&mut things);

        things
            .get_mut("room-1")
            .unwrap()
            .submit_command("cmd/room", "toggle");
        assert!(connector.fetch_commands(&mut things));
        connector.send_commands(&things).await;

        assert_eq!(
            connector.client.set_light_calls,
            vec![
                ("light-1".to_string(), Some(false), None),
                ("light-2".to_string(), Some(false), None),
            ]
        );
    }

    #[tokio::test]
    async fn dim_below_the_effective_floor_becomes_switch_off() {
        let mut things = ThingRegistry::new();
        things
            .register(
                Thing::new("light-1", "Light")
                    .with_cmd_topic("cmd/light")
                    .with_state_topic("state/light")
                    .with_min_brightness(10.0),
            )
            .unwrap();
        let state = FullState {
            lights: vec![item(json!({
                "type": "light",
                "id": "light-1",
                "on": {"on": false},
                "dimming": {"brightness": 0.0, "min_dim_level": 20.0},
            }))],
            ..Default::default()
        };
        let mut connector = connected(state, &mut things).await;

        // Hardware floor (20) beats the configured minimum (10).
        things.get_mut("light-1").unwrap().submit_command("cmd/light", "15");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert_eq!(
            connector.client.set_light_calls,
            vec![("light-1".to_string(), Some(false), None)]
        );

        connector.client.set_light_calls.clear();
        things.get_mut("light-1").unwrap().submit_command("cmd/light", "20");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert_eq!(
            connector.client.set_light_calls,
            vec![("light-1".to_string(), Some(true), Some(20.0))]
        );
    }

    #[tokio::test]
    async fn command_for_an_uncached_item_is_skipped_silently() {
        let mut things = ThingRegistry::new();
        things
            .register(
                Thing::new("light-1", "Light")
                    .with_cmd_topic("cmd/light")
                    .with_state_topic("state/light"),
            )
            .unwrap();
        let mut connector = connected(FullState::default(), &mut things).await;

        things.get_mut("light-1").unwrap().reopen();
        things.get_mut("light-1").unwrap().submit_command("cmd/light", "on");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert!(connector.client.set_light_calls.is_empty());
    }

    #[tokio::test]
    async fn failed_vendor_call_does_not_abort_the_queue() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", false, Some(0.0)), light("light-2", false, Some(0.0))),
            &mut things,
        )
        .await;

        connector.client.fail_set_light = vec!["light-1".into()];
        things.get_mut("light-1").unwrap().submit_command("cmd/light1", "on");
        things.get_mut("light-2").unwrap().submit_command("cmd/light2", "on");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert!(connector.commands.is_empty(), "queue fully drained despite failures");
        assert_eq!(
            connector.client.set_light_calls,
            vec![("light-2".to_string(), Some(true), None)]
        );
    }

    #[tokio::test]
    async fn failed_group_member_does_not_block_the_rest_of_the_group() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", false, Some(0.0)), light("light-2", false, Some(0.0))),
            &mut things,
        )
        .await;

        connector.client.fail_set_light = vec!["light-1".into()];
        things.get_mut("room-1").unwrap().submit_command("cmd/room", "69");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert_eq!(
            connector.client.set_light_calls,
            vec![("light-2".to_string(), Some(true), Some(69.0))]
        );
    }

    #[tokio::test]
    async fn group_dim_honours_each_members_own_minimum() {
        let mut things = ThingRegistry::new();
        things
            .register(
                Thing::new("light-1", "Light One")
                    .with_cmd_topic("cmd/light1")
                    .with_state_topic("state/light1"),
            )
            .unwrap();
        things
            .register(
                Thing::new("light-2", "Light Two")
                    .with_cmd_topic("cmd/light2")
                    .with_state_topic("state/light2")
                    .with_min_brightness(50.0),
            )
            .unwrap();
        things
            .register(
                Thing::new("room-1", "Living Room")
                    .with_cmd_topic("cmd/room")
                    .with_state_topic("state/room"),
            )
            .unwrap();
        let mut connector = connected(
            room_state(light("light-1", false, Some(0.0)), light("light-2", false, Some(0.0))),
            &mut things,
        )
        .await;

        things.get_mut("room-1").unwrap().submit_command("cmd/room", "30");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert_eq!(
            connector.client.set_light_calls,
            vec![
                ("light-1".to_string(), Some(true), Some(30.0)),
                ("light-2".to_string(), Some(false), None),
            ]
        );
    }

    #[tokio::test]
    async fn stream_drop_reports_things_offline() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", true, Some(50.0)), light("light-2", true, Some(50.0))),
            &mut things,
        )
        .await;

        connector.client.events.push(HueStreamEvent::Disconnected);
        connector.poll(&mut things);
        flush_all(&mut connector, &mut things);

        for id in ["light-1", "light-2", "room-1"] {
            let messages = things.get_mut(id).unwrap().drain_state_messages().unwrap();
            let payload = json_payload(messages.last().unwrap());
            assert_eq!(payload["status"], "offline", "{id} must be offline");
            assert!(payload.get("brightness").is_none());
        }
    }

    #[tokio::test]
    async fn dim_command_to_a_room_lights_every_member() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", false, Some(0.0)), light("light-2", false, Some(0.0))),
            &mut things,
        )
        .await;

        things.get_mut("room-1").unwrap().submit_command("cmd/room", "69");
        assert!(connector.fetch_commands(&mut things));
        connector.send_commands(&things).await;

        assert_eq!(
            connector.client.set_light_calls,
            vec![
                ("light-1".to_string(), Some(true), Some(69.0)),
                ("light-2".to_string(), Some(true), Some(69.0)),
            ]
        );

        // The bridge acknowledges with per-light updates plus a
        // grouped_light update.
        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            light("light-1", true, Some(69.0)),
        ));
        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            light("light-2", true, Some(69.0)),
        ));
        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            grouped_light("grouped-1", true),
        ));
        connector.poll(&mut things);
        flush_all(&mut connector, &mut things);

        for id in ["light-1", "light-2"] {
            let messages = things.get_mut(id).unwrap().drain_state_messages().unwrap();
            assert_eq!(messages.len(), 1);
            let payload = json_payload(&messages[0]);
            assert_eq!(payload["status"], "on");
            assert_eq!(payload["brightness"], 69);
        }
        let messages = things.get_mut("room-1").unwrap().drain_state_messages().unwrap();
        assert_eq!(messages.len(), 1);
        let payload = json_payload(&messages[0]);
        assert_eq!(payload["name"], "Living Room");
        assert_eq!(payload["status"], "on");
        assert_eq!(payload["brightness"], 69);
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn switch_only_light_gets_on_then_dim_to_switch_off() {
        let mut things = ThingRegistry::new();
        things
            .register(
                Thing::new("light-1", "Hallway")
                    .with_cmd_topic("cmd/hall")
                    .with_state_topic("state/hall")
                    .with_min_brightness(10.0),
            )
            .unwrap();
        let state = FullState {
            lights: vec![light("light-1", false, None)],
            ..Default::default()
        };
        let mut connector = connected(state, &mut things).await;

        // "69" to a non-dimmable light is a plain switch-on.
        things.get_mut("light-1").unwrap().submit_command("cmd/hall", "69");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert_eq!(
            connector.client.set_light_calls,
            vec![("light-1".to_string(), Some(true), None)]
        );

        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            light("light-1", true, None),
        ));
        connector.poll(&mut things);
        flush_all(&mut connector, &mut things);
        let messages = things.get_mut("light-1").unwrap().drain_state_messages().unwrap();
        let payload = json_payload(&messages[0]);
        assert_eq!(payload["status"], "on");
        assert!(payload.get("brightness").is_none());

        // "5" is below the 10-percent floor and becomes switch-off.
        connector.client.set_light_calls.clear();
        things.get_mut("light-1").unwrap().submit_command("cmd/hall", "5");
        connector.fetch_commands(&mut things);
        connector.send_commands(&things).await;
        assert_eq!(
            connector.client.set_light_calls,
            vec![("light-1".to_string(), Some(false), None)]
        );

        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Update,
            light("light-1", false, None),
        ));
        connector.poll(&mut things);
        flush_all(&mut connector, &mut things);
        let messages = things.get_mut("light-1").unwrap().drain_state_messages().unwrap();
        let payload = json_payload(&messages[0]);
        assert_eq!(payload["status"], "off");
        assert!(payload.get("brightness").is_none());
    }

    #[tokio::test]
    async fn deleted_light_reports_offline() {
        let mut things = registry_for_room();
        let mut connector = connected(
            room_state(light("light-1", true, Some(50.0)), light("light-2", true, Some(50.0))),
            &mut things,
        )
        .await;

        connector.client.events.push(HueStreamEvent::Resource(
            HueEventType::Delete,
            light("light-1", true, Some(50.0)),
        ));
        connector.poll(&mut things);
        flush_all(&mut connector, &mut things);

        let messages = things.get_mut("light-1").unwrap().drain_state_messages().unwrap();
        let payload = json_payload(&messages[0]);
        assert_eq!(payload["status"], "offline");
        assert!(payload.get("brightness").is_none());
    }
}

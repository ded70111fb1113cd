//! Normalizes vendor push events into [`ThingEvent`]s.

use crate::hue::model::{HueEventType, HueItem};
use crate::thing::{ThingEvent, ThingStatus};

/// Convert a vendor event into the MQTT-facing representation.
///
/// A caller-provided `name` (the configured thing name) takes precedence
/// over the item's own metadata. Brightness is only reported when the item
/// has both an on-feature and a dimming feature: the current level while on,
/// exactly 0 while off.
pub fn to_thing_event(
    event_type: HueEventType,
    item: &HueItem,
    name: Option<&str>,
) -> ThingEvent {
    let mut event = ThingEvent {
        id: Some(item.id().to_string()),
        ..Default::default()
    };

    if matches!(event_type, HueEventType::Delete | HueEventType::Disconnected) {
        event.status = Some(ThingStatus::Offline);
        return event;
    }

    let on = item.on();
    if let Some(on) = on {
        event.status = Some(if on.on { ThingStatus::On } else { ThingStatus::Off });
    }

    if let (Some(on), Some(dimming)) = (on, item.dimming()) {
        event.brightness = Some(if on.on { dimming.brightness } else { 0.0 });
    }

    event.name = name
        .map(str::to_string)
        .or_else(|| item.name().map(str::to_string));

    event.kind = Some(match item.kind() {
        "grouped_light" => "group".to_string(),
        kind => kind.to_string(),
    });

    event
}

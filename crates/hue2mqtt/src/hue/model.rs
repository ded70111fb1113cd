//! Typed subset of the CLIP v2 resource model.
//!
//! Only the resource types and features the bridge logic needs are modeled;
//! everything else in a bridge response is dropped at the parse boundary.

use serde::Deserialize;

/// Cross-reference between resources (`owner`, `children`, `services`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceLink {
    pub rid: String,
    pub rtype: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct OnFeature {
    pub on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DimmingFeature {
    pub brightness: f64,

    /// Hardware floor in percent; dimming below it is not supported.
    #[serde(default)]
    pub min_dim_level: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Metadata {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Light {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub on: Option<OnFeature>,
    #[serde(default)]
    pub dimming: Option<DimmingFeature>,
    #[serde(default)]
    pub owner: Option<ResourceLink>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GroupedLight {
    pub id: String,
    #[serde(default)]
    pub on: Option<OnFeature>,
    #[serde(default)]
    pub dimming: Option<DimmingFeature>,
    #[serde(default)]
    pub owner: Option<ResourceLink>,
}

/// Room or zone. The group itself carries no on/off state; that lives on
/// its grouped_light service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Group {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub children: Vec<ResourceLink>,
    #[serde(default)]
    pub services: Vec<ResourceLink>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Device {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub services: Vec<ResourceLink>,
}

/// One CLIP v2 resource, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HueItem {
    Light(Light),
    GroupedLight(GroupedLight),
    Room(Group),
    Zone(Group),
    Device(Device),
}

impl HueItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Light(light) => &light.id,
            Self::GroupedLight(grouped) => &grouped.id,
            Self::Room(group) | Self::Zone(group) => &group.id,
            Self::Device(device) => &device.id,
        }
    }

    /// Lower-cased resource type as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Light(_) => "light",
            Self::GroupedLight(_) => "grouped_light",
            Self::Room(_) => "room",
            Self::Zone(_) => "zone",
            Self::Device(_) => "device",
        }
    }

    pub fn name(&self) -> Option<&str> {
        let metadata = match self {
            Self::Light(light) => light.metadata.as_ref(),
            Self::GroupedLight(_) => None,
            Self::Room(group) | Self::Zone(group) => group.metadata.as_ref(),
            Self::Device(device) => device.metadata.as_ref(),
        };
        metadata.map(|m| m.name.as_str())
    }

    pub fn on(&self) -> Option<OnFeature> {
        match self {
            Self::Light(light) => light.on,
            Self::GroupedLight(grouped) => grouped.on,
            _ => None,
        }
    }

    pub fn dimming(&self) -> Option<DimmingFeature> {
        match self {
            Self::Light(light) => light.dimming,
            Self::GroupedLight(grouped) => grouped.dimming,
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Self::Room(group) | Self::Zone(group) => Some(group),
            _ => None,
        }
    }

    pub fn as_device(&self) -> Option<&Device> {
        match self {
            Self::Device(device) => Some(device),
            _ => None,
        }
    }
}

impl Group {
    /// The grouped_light service carrying the group's on/off state.
    pub fn grouped_light_service(&self) -> Option<&str> {
        self.services
            .iter()
            .find(|link| link.rtype == "grouped_light")
            .map(|link| link.rid.as_str())
    }
}

impl Device {
    pub fn light_services(&self) -> impl Iterator<Item = &str> {
        self.services
            .iter()
            .filter(|link| link.rtype == "light")
            .map(|link| link.rid.as_str())
    }
}

/// Parse a CLIP `data` array, silently skipping resource types that are not
/// modeled here.
pub fn parse_items(data: Vec<serde_json::Value>) -> Vec<HueItem> {
    data.into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

/// Snapshot of all resources the connector cares about.
#[derive(Debug, Clone, Default)]
pub struct FullState {
    pub devices: Vec<HueItem>,
    pub lights: Vec<HueItem>,
    pub rooms: Vec<HueItem>,
    pub zones: Vec<HueItem>,
    pub grouped_lights: Vec<HueItem>,
}

/// The event-stream frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HueEventType {
    Update,
    Add,
    Delete,
    /// Synthesized when the event stream drops, never seen on the wire.
    Disconnected,
}

impl HueEventType {
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "update" => Some(Self::Update),
            "add" => Some(Self::Add),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

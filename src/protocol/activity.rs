//! The activity model carried by presence updates.
//!
//! Field names and integer discriminants follow the gateway's wire format
//! exactly; absent optional fields are omitted from the serialized JSON
//! rather than sent as `null`.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

/// How the gateway renders an activity's headline.
#[derive(
    Copy, Clone, Debug, Default, Eq, Hash, PartialEq, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum ActivityType {
    /// "Playing {name}"
    #[default]
    Playing = 0,
    /// "Streaming {details}"
    Streaming = 1,
    /// "Listening to {name}"
    Listening = 2,
    /// "Watching {name}"
    Watching = 3,
    /// "{emoji} {state}"
    Custom = 4,
    /// "Competing in {name}"
    Competing = 5,
}

/// Which activity field doubles as the status line.
#[derive(
    Copy, Clone, Debug, Default, Eq, Hash, PartialEq, Serialize_repr, Deserialize_repr,
)]
#[repr(u8)]
pub enum StatusDisplayType {
    #[default]
    Name = 0,
    State = 1,
    Details = 2,
}

/// Unix-millisecond start/end markers rendered as elapsed/remaining time.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Timestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

/// Artwork references and hover text.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Assets {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub small_url: Option<String>,
}

/// One entry in a presence update's activity list.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Activity {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: ActivityType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamps: Option<Timestamps>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assets: Option<Assets>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_display_type: Option<StatusDisplayType>,
}

impl Activity {
    /// A watching-type activity with the crate's display defaults.
    #[must_use]
    pub fn watching(name: String) -> Self {
        Self {
            name,
            kind: ActivityType::Watching,
            url: None,
            details: None,
            details_url: None,
            state: None,
            timestamps: None,
            assets: None,
            status_display_type: Some(StatusDisplayType::Details),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_types_serialize_as_integers() {
        let json = serde_json::to_value(ActivityType::Watching).unwrap();
        assert_eq!(json, serde_json::json!(3));

        let json = serde_json::to_value(StatusDisplayType::Details).unwrap();
        assert_eq!(json, serde_json::json!(2));
    }

    #[test]
    fn absent_fields_are_omitted() {
        let activity = Activity::watching("Heat".to_string());
        let json = serde_json::to_value(&activity).unwrap();

        assert_eq!(json["name"], "Heat");
        assert_eq!(json["type"], 3);
        assert_eq!(json["status_display_type"], 2);
        let object = json.as_object().unwrap();
        assert!(!object.contains_key("timestamps"));
        assert!(!object.contains_key("assets"));
        assert!(!object.contains_key("url"));
    }

    #[test]
    fn timestamps_carry_only_known_edges() {
        let timestamps = Timestamps {
            start: Some(1_700_000_000_000),
            end: None,
        };
        let json = serde_json::to_value(timestamps).unwrap();
        assert_eq!(json["start"], 1_700_000_000_000_u64);
        assert!(!json.as_object().unwrap().contains_key("end"));
    }
}

//! Gateway frames and their payloads.
//!
//! Every frame is a JSON object `{op, d, s, t}`. Outbound frames are built
//! through the constructors on [`Frame`]; inbound frames are deserialized
//! whole and their `d` payload parsed per opcode. Unknown opcodes
//! deserialize to [`Opcode::Unknown`] so a protocol extension never breaks
//! the read loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

use super::activity::Activity;

/// Dispatch event announcing a completed handshake.
pub const EVENT_READY: &str = "READY";

/// Dispatch event announcing a completed session resumption.
pub const EVENT_RESUMED: &str = "RESUMED";

/// Gateway opcodes, as sent on the wire.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Opcode {
    /// Inbound event carrying a name (`t`) and sequence number (`s`).
    Dispatch = 0,
    /// Outbound keep-alive carrying the last seen sequence number.
    Heartbeat = 1,
    /// Outbound first-handshake authentication.
    Identify = 2,
    /// Outbound presence update; an empty activity list clears presence.
    PresenceUpdate = 3,
    /// Outbound session resumption after a reconnect.
    Resume = 6,
    /// Inbound instruction to reconnect, preserving the session.
    Reconnect = 7,
    /// Inbound instruction to drop the session and identify afresh.
    InvalidSession = 9,
    /// Inbound first frame, carrying the heartbeat interval.
    Hello = 10,
    /// Inbound acknowledgement of a heartbeat.
    HeartbeatAck = 11,
    #[serde(other)]
    Unknown = 255,
}

/// One gateway frame, inbound or outbound.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Frame {
    pub op: Opcode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Client properties declared in the IDENTIFY payload.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ClientProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ClientProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_owned(),
            browser: "chrome".to_owned(),
            device: env!("CARGO_PKG_NAME").to_owned(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Identify<'a> {
    token: &'a str,
    intents: u8,
    properties: &'a ClientProperties,
}

#[derive(Debug, Serialize)]
struct Resume<'a> {
    token: &'a str,
    session_id: &'a str,
    seq: u64,
}

/// HELLO payload.
#[derive(Clone, Debug, Deserialize)]
pub struct Hello {
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval: u64,
}

/// READY dispatch payload; only the fields the connection caches.
#[derive(Clone, Debug, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub resume_gateway_url: String,
}

/// Presence update payload.
///
/// `since` and `afk` are always serialized; the gateway distinguishes
/// `"since": null` from an absent field.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PresenceUpdate {
    pub activities: Vec<Activity>,
    pub status: String,
    pub afk: bool,
    pub since: Option<u64>,
}

impl PresenceUpdate {
    /// Presence carrying live activities.
    #[must_use]
    pub fn active(activities: Vec<Activity>) -> Self {
        Self {
            activities,
            status: "dnd".to_owned(),
            afk: true,
            since: Some(0),
        }
    }

    /// Explicit empty-activity-list update clearing presence.
    #[must_use]
    pub fn clear() -> Self {
        Self {
            activities: Vec::new(),
            status: "online".to_owned(),
            afk: false,
            since: None,
        }
    }
}

impl Frame {
    fn outbound(op: Opcode, d: Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }

    /// Keep-alive carrying the last seen sequence number, `null` before the
    /// first dispatch.
    #[must_use]
    pub fn heartbeat(last_seq: Option<u64>) -> Self {
        Self::outbound(Opcode::Heartbeat, last_seq.map_or(Value::Null, Value::from))
    }

    /// First-handshake authentication.
    #[must_use]
    pub fn identify(token: &str, properties: &ClientProperties) -> Self {
        let payload = Identify {
            token,
            intents: 0,
            properties,
        };
        Self::outbound(
            Opcode::Identify,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    /// Session resumption with the cached session id and sequence number.
    #[must_use]
    pub fn resume(token: &str, session_id: &str, seq: u64) -> Self {
        let payload = Resume {
            token,
            session_id,
            seq,
        };
        Self::outbound(
            Opcode::Resume,
            serde_json::to_value(payload).unwrap_or(Value::Null),
        )
    }

    /// Presence update.
    #[must_use]
    pub fn presence(update: &PresenceUpdate) -> Self {
        Self::outbound(
            Opcode::PresenceUpdate,
            serde_json::to_value(update).unwrap_or(Value::Null),
        )
    }

    /// Parses the `d` payload into a typed structure.
    pub fn payload<T>(&self) -> Result<T, serde_json::Error>
    where
        T: for<'de> Deserialize<'de>,
    {
        T::deserialize(self.d.clone().unwrap_or(Value::Null))
    }

    /// Whether this is a dispatch frame for the given event name.
    #[must_use]
    pub fn is_event(&self, name: &str) -> bool {
        self.op == Opcode::Dispatch && self.t.as_deref() == Some(name)
    }
}

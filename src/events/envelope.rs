//! Versioned envelope wrapped around every streamed progress event.
//!
//! Wire shape:
//! `{"version":"v1","type":"<tag>","timestamp":<unix_float>,"conversation_id":"<id>", ...payload}`
//!
//! Envelopes are immutable once emitted. The event-type set is closed, but an
//! unknown tag is still publishable so newer producers do not break older
//! consumers.

use chrono::Utc;
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

/// Current envelope schema version
pub const ENVELOPE_VERSION: &str = "v1";

/// Closed set of progress event types, plus a forward-compatible fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Content,
    Routing,
    Thinking,
    Research,
    Writing,
    Formatting,
    Done,
    Error,
    Cost,
    Metrics,
    /// Unrecognized tag, passed through rather than rejected
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Content => "content",
            EventType::Routing => "routing",
            EventType::Thinking => "thinking",
            EventType::Research => "research",
            EventType::Writing => "writing",
            EventType::Formatting => "formatting",
            EventType::Done => "done",
            EventType::Error => "error",
            EventType::Cost => "cost",
            EventType::Metrics => "metrics",
            EventType::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "content" => EventType::Content,
            "routing" => EventType::Routing,
            "thinking" => EventType::Thinking,
            "research" => EventType::Research,
            "writing" => EventType::Writing,
            "formatting" => EventType::Formatting,
            "done" => EventType::Done,
            "error" => EventType::Error,
            "cost" => EventType::Cost,
            "metrics" => EventType::Metrics,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Other(_))
    }

    /// Payload fields a well-formed event of this type carries.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EventType::Content | EventType::Thinking => &["text"],
            EventType::Routing => &["node"],
            EventType::Research => &["query"],
            EventType::Writing => &["section"],
            EventType::Formatting => &["stage"],
            EventType::Done => &[],
            EventType::Error => &["code", "message"],
            EventType::Cost => &["credits"],
            EventType::Metrics => &["name", "value"],
            EventType::Other(_) => &[],
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One emitted progress event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub version: String,
    pub event_type: EventType,
    /// Unix seconds with sub-second precision, injected at publish when absent
    pub timestamp: f64,
    pub conversation_id: String,
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current wall clock.
    pub fn now(
        conversation_id: impl Into<String>,
        event_type: EventType,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            event_type,
            timestamp: unix_now(),
            conversation_id: conversation_id.into(),
            payload,
        }
    }

    /// Build an envelope with a caller-supplied timestamp.
    pub fn at(
        conversation_id: impl Into<String>,
        event_type: EventType,
        timestamp: f64,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            event_type,
            timestamp,
            conversation_id: conversation_id.into(),
            payload,
        }
    }

    /// Payload fields required for this event type but absent from it.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        self.event_type
            .required_fields()
            .iter()
            .filter(|f| !self.payload.contains_key(**f))
            .copied()
            .collect()
    }
}

/// Current time as unix seconds with microsecond precision.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// Flattened wire serialization: reserved keys first, then the payload.
impl Serialize for EventEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4 + self.payload.len()))?;
        map.serialize_entry("version", &self.version)?;
        map.serialize_entry("type", self.event_type.as_str())?;
        map.serialize_entry("timestamp", &self.timestamp)?;
        map.serialize_entry("conversation_id", &self.conversation_id)?;
        for (key, value) in &self.payload {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for EventEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let mut map = Map::deserialize(deserializer)?;

        let version = match map.remove("version") {
            Some(Value::String(v)) => v,
            _ => return Err(D::Error::missing_field("version")),
        };
        let event_type = match map.remove("type") {
            Some(Value::String(t)) => EventType::parse(&t),
            _ => return Err(D::Error::missing_field("type")),
        };
        let timestamp = match map.remove("timestamp") {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| D::Error::custom("timestamp is not a float"))?,
            _ => return Err(D::Error::missing_field("timestamp")),
        };
        let conversation_id = match map.remove("conversation_id") {
            Some(Value::String(c)) => c,
            _ => return Err(D::Error::missing_field("conversation_id")),
        };

        Ok(EventEnvelope {
            version,
            event_type,
            timestamp,
            conversation_id,
            payload: map,
        })
    }
}

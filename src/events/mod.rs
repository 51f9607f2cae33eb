//! Live progress streaming and its durable history.
//!
//! - Versioned envelopes with a closed event-type set
//! - Per-conversation broadcast channels, fire-and-forget publishing
//! - Append-only history log as the replay source of truth

pub mod envelope;
pub mod history;
pub mod publisher;

pub use envelope::{unix_now, EventEnvelope, EventType, ENVELOPE_VERSION};
pub use history::{EventHistory, HistoryWriter, MemoryEventHistory, PostgresEventHistory};
pub use publisher::EventBus;

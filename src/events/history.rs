//! Durable event history — the append-only source of truth for replay.
//!
//! Live delivery is fire-and-forget; this log is what history queries read.
//! Writes go through a dedicated writer task fed by an unbounded queue so a
//! slow database never blocks the publishing path.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::Result;

use super::envelope::EventEnvelope;

/// Append-only log of envelopes keyed by conversation id.
#[async_trait]
pub trait EventHistory: Send + Sync {
    async fn append(&self, envelope: &EventEnvelope) -> Result<()>;

    /// Events for a conversation in emission order, up to `limit`.
    async fn events_for(&self, conversation_id: &str, limit: i64) -> Result<Vec<EventEnvelope>>;

    /// Events emitted after `after` (an envelope timestamp, the replay
    /// cursor a reconnecting consumer resumes from), up to `limit`.
    async fn events_since(
        &self,
        conversation_id: &str,
        after: f64,
        limit: i64,
    ) -> Result<Vec<EventEnvelope>>;

    async fn count(&self, conversation_id: &str) -> Result<i64>;
}

/// In-memory history for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryEventHistory {
    events: DashMap<String, Vec<EventEnvelope>>,
}

impl MemoryEventHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventHistory for MemoryEventHistory {
    async fn append(&self, envelope: &EventEnvelope) -> Result<()> {
        self.events
            .entry(envelope.conversation_id.clone())
            .or_default()
            .push(envelope.clone());
        Ok(())
    }

    async fn events_for(&self, conversation_id: &str, limit: i64) -> Result<Vec<EventEnvelope>> {
        Ok(self
            .events
            .get(conversation_id)
            .map(|events| events.iter().take(limit as usize).cloned().collect())
            .unwrap_or_default())
    }

    async fn events_since(
        &self,
        conversation_id: &str,
        after: f64,
        limit: i64,
    ) -> Result<Vec<EventEnvelope>> {
        Ok(self
            .events
            .get(conversation_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.timestamp > after)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self, conversation_id: &str) -> Result<i64> {
        Ok(self
            .events
            .get(conversation_id)
            .map(|events| events.len() as i64)
            .unwrap_or(0))
    }
}

/// Postgres-backed history
pub struct PostgresEventHistory {
    pool: PgPool,
}

impl PostgresEventHistory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the event log table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_events (
                id BIGSERIAL PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                envelope JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_events_conversation \
             ON conversation_events(conversation_id, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl EventHistory for PostgresEventHistory {
    async fn append(&self, envelope: &EventEnvelope) -> Result<()> {
        let body = serde_json::to_value(envelope)?;

        sqlx::query(
            r#"
            INSERT INTO conversation_events (conversation_id, event_type, envelope)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(&envelope.conversation_id)
        .bind(envelope.event_type.as_str())
        .bind(&body)
        .execute(&self.pool)
        .await?;

        debug!(
            conversation = %envelope.conversation_id,
            event_type = %envelope.event_type,
            "appended event to history"
        );

        Ok(())
    }

    async fn events_for(&self, conversation_id: &str, limit: i64) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT envelope
            FROM conversation_events
            WHERE conversation_id = $1
            ORDER BY id ASC
            LIMIT $2
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let body: serde_json::Value = row.get("envelope");
            events.push(serde_json::from_value(body)?);
        }
        Ok(events)
    }

    async fn events_since(
        &self,
        conversation_id: &str,
        after: f64,
        limit: i64,
    ) -> Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT envelope
            FROM conversation_events
            WHERE conversation_id = $1
              AND (envelope->>'timestamp')::double precision > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(conversation_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            let body: serde_json::Value = row.get("envelope");
            events.push(serde_json::from_value(body)?);
        }
        Ok(events)
    }

    async fn count(&self, conversation_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count
            FROM conversation_events
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        Ok(count)
    }
}

/// Drains published envelopes into the durable log off the hot path.
pub struct HistoryWriter {
    handle: JoinHandle<()>,
}

impl HistoryWriter {
    /// Spawn the writer task. Returns the sender to feed and the writer.
    pub fn spawn(
        history: Arc<dyn EventHistory>,
    ) -> (mpsc::UnboundedSender<EventEnvelope>, Self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<EventEnvelope>();

        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = history.append(&envelope).await {
                    error!(
                        conversation = %envelope.conversation_id,
                        "failed to persist event: {}",
                        e
                    );
                }
            }
            debug!("history writer drained and shut down");
        });

        (tx, Self { handle })
    }

    /// Wait for the writer to drain after all senders are dropped.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::envelope::EventType;
    use serde_json::Map;

    #[tokio::test]
    async fn test_memory_history_appends_in_order() {
        let history = MemoryEventHistory::new();

        for i in 0..3 {
            let mut payload = Map::new();
            payload.insert("text".to_string(), serde_json::json!(format!("chunk {i}")));
            let env = EventEnvelope::now("conv-1", EventType::Content, payload);
            history.append(&env).await.unwrap();
        }

        let events = history.events_for("conv-1", 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload["text"], "chunk 0");
        assert_eq!(history.count("conv-1").await.unwrap(), 3);
        assert_eq!(history.count("conv-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_events_since_resumes_from_cursor() {
        let history = MemoryEventHistory::new();

        for ts in [10.0, 20.0, 30.0] {
            let env = EventEnvelope::at("conv-1", EventType::Done, ts, Map::new());
            history.append(&env).await.unwrap();
        }

        let resumed = history.events_since("conv-1", 10.0, 10).await.unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].timestamp, 20.0);
    }

    #[tokio::test]
    async fn test_writer_drains_queue() {
        let history = Arc::new(MemoryEventHistory::new());
        let (tx, writer) = HistoryWriter::spawn(history.clone());

        for _ in 0..5 {
            let env = EventEnvelope::now("conv-9", EventType::Done, Map::new());
            tx.send(env).unwrap();
        }
        drop(tx);
        writer.join().await;

        assert_eq!(history.count("conv-9").await.unwrap(), 5);
    }
}

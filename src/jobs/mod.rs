//! Background job queue over Postgres.
//!
//! One row per unit of work. The only property the core depends on is that
//! `claim` is atomic: exactly one worker locks a given row, enforced by a
//! single `FOR UPDATE SKIP LOCKED` statement. `attempts` increments on every
//! failed run so poison jobs age out at the cap.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, warn};

use crate::error::Result;

/// Lifecycle state of one job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Locked,
    Done,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Locked => write!(f, "locked"),
            JobState::Done => write!(f, "done"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl JobState {
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "queued" => Some(JobState::Queued),
            "locked" => Some(JobState::Locked),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// One claimed or inspected job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> JobRecord {
    let state: String = row.get("state");
    JobRecord {
        id: row.get("id"),
        job_type: row.get("job_type"),
        payload: row.get("payload"),
        state: JobState::parse(&state).unwrap_or(JobState::Failed),
        priority: row.get("priority"),
        locked_by: row.get("locked_by"),
        locked_at: row.get("locked_at"),
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    }
}

pub struct JobQueue {
    pool: PgPool,
}

impl JobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the job table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BIGSERIAL PRIMARY KEY,
                job_type TEXT NOT NULL,
                payload JSONB NOT NULL DEFAULT '{}'::jsonb,
                state TEXT NOT NULL DEFAULT 'queued'
                    CHECK (state IN ('queued', 'locked', 'done', 'failed')),
                priority INTEGER NOT NULL DEFAULT 0,
                locked_by TEXT,
                locked_at TIMESTAMPTZ,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claimable \
             ON jobs(priority DESC, created_at) WHERE state = 'queued'",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Enqueue a unit of work. Higher priority is claimed first.
    pub async fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO jobs (job_type, payload, state, priority, attempts)
            VALUES ($1, $2, 'queued', $3, 0)
            RETURNING id
            "#,
        )
        .bind(job_type)
        .bind(&payload)
        .bind(priority)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.get("id");
        debug!(job_type, id, priority, "job enqueued");
        Ok(id)
    }

    /// Claim the highest-priority queued job for `worker_id`.
    ///
    /// The inner `FOR UPDATE SKIP LOCKED` select plus the update run as one
    /// statement, so concurrent workers can never lock the same row.
    pub async fn claim(&self, worker_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'locked', locked_by = $1, locked_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'queued'
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, job_type, payload, state, priority, locked_by, locked_at,
                      attempts, last_error, created_at
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row))
    }

    /// Mark a locked job done.
    pub async fn complete(&self, id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'done', locked_by = NULL, locked_at = NULL
            WHERE id = $1 AND state = 'locked'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        debug!(id, "job completed");
        Ok(())
    }

    /// Record a failed run: increment `attempts`, requeue below the cap,
    /// park as failed at it.
    pub async fn fail(&self, id: i64, error: &str, max_attempts: i32) -> Result<JobState> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                last_error = $2,
                locked_by = NULL,
                locked_at = NULL,
                state = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE 'queued' END
            WHERE id = $1 AND state = 'locked'
            RETURNING state
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        let state: String = row.get("state");
        let state = JobState::parse(&state).unwrap_or(JobState::Failed);
        if state == JobState::Failed {
            warn!(id, error, "job exhausted its attempts");
        }
        Ok(state)
    }

    /// Requeue jobs whose worker disappeared mid-run.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - older_than;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'queued', locked_by = NULL, locked_at = NULL,
                attempts = attempts + 1
            WHERE state = 'locked' AND locked_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(requeued, "requeued stale locked jobs");
        }
        Ok(requeued)
    }
}

//! Failure log for traces whose analysis failed
//!
//! A failed trace stays unanalyzed. Its failure is recorded here, keyed by
//! trace id, so operators can inspect and re-enqueue it.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::TraceId;
use crate::infra::{AnalyzerError, FailureLog, Result};

/// Why a trace failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Payload could not be walked
    MalformedPayload,
    /// Commit kept hitting transient errors
    ExhaustedRetries,
    /// Permanent database error
    Database,
    /// Queue error
    Queue,
    /// Unknown/other error
    Unknown,
}

impl FailureReason {
    pub fn from_error(err: &AnalyzerError) -> Self {
        match err {
            AnalyzerError::MalformedPayload(_) => FailureReason::MalformedPayload,
            AnalyzerError::ExhaustedRetries { .. } => FailureReason::ExhaustedRetries,
            AnalyzerError::Database(_) => FailureReason::Database,
            AnalyzerError::Queue(_) => FailureReason::Queue,
            _ => FailureReason::Unknown,
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "malformed_payload" => FailureReason::MalformedPayload,
            "exhausted_retries" => FailureReason::ExhaustedRetries,
            "database" => FailureReason::Database,
            "queue" => FailureReason::Queue,
            _ => FailureReason::Unknown,
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MalformedPayload => write!(f, "malformed_payload"),
            FailureReason::ExhaustedRetries => write!(f, "exhausted_retries"),
            FailureReason::Database => write!(f, "database"),
            FailureReason::Queue => write!(f, "queue"),
            FailureReason::Unknown => write!(f, "unknown"),
        }
    }
}

/// A failed analysis record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisFailure {
    pub trace_id: TraceId,
    pub reason: FailureReason,
    pub error_message: String,
    /// Number of failed analyses of this trace
    pub attempts: i32,
    pub last_failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisFailure {
    pub fn new(trace_id: TraceId, err: &AnalyzerError) -> Self {
        let now = Utc::now();
        Self {
            trace_id,
            reason: FailureReason::from_error(err),
            error_message: err.to_string(),
            attempts: 1,
            last_failed_at: now,
            created_at: now,
        }
    }
}

/// PostgreSQL-backed failure log
pub struct PgFailureLog {
    pool: PgPool,
}

impl PgFailureLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Count recorded failures
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM analysis_failures")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0)
    }

    /// Failure counts grouped by reason
    pub async fn stats(&self) -> Result<FailureStats> {
        let total = self.count().await?;

        let by_reason: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT reason, COUNT(*) as count
            FROM analysis_failures
            GROUP BY reason
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let highest_attempts: (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(attempts), 0) FROM analysis_failures")
                .fetch_one(&self.pool)
                .await?;

        Ok(FailureStats {
            total_count: total,
            by_reason: by_reason.into_iter().collect(),
            highest_attempts: highest_attempts.0,
        })
    }
}

#[async_trait]
impl FailureLog for PgFailureLog {
    async fn record(&self, failure: AnalysisFailure) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_failures (
                id, trace_uuid, reason, error_message, attempts, last_failed_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (trace_uuid) DO UPDATE SET
                reason = EXCLUDED.reason,
                error_message = EXCLUDED.error_message,
                attempts = analysis_failures.attempts + 1,
                last_failed_at = EXCLUDED.last_failed_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(failure.trace_id.0)
        .bind(failure.reason.to_string())
        .bind(&failure.error_message)
        .bind(failure.attempts)
        .bind(failure.last_failed_at)
        .bind(failure.created_at)
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            trace_id = %failure.trace_id,
            reason = %failure.reason,
            error = %failure.error_message,
            "Trace analysis failure recorded"
        );

        Ok(())
    }

    async fn clear(&self, trace_id: TraceId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM analysis_failures WHERE trace_uuid = $1")
            .bind(trace_id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, limit: i64) -> Result<Vec<AnalysisFailure>> {
        let rows = sqlx::query_as::<_, FailureRow>(
            r#"
            SELECT trace_uuid, reason, error_message, attempts, last_failed_at, created_at
            FROM analysis_failures
            ORDER BY last_failed_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AnalysisFailure::from).collect())
    }
}

/// Failure counts
#[derive(Debug, Clone, Serialize)]
pub struct FailureStats {
    pub total_count: i64,
    pub by_reason: HashMap<String, i64>,
    pub highest_attempts: i32,
}

#[derive(Debug, sqlx::FromRow)]
struct FailureRow {
    trace_uuid: Uuid,
    reason: String,
    error_message: String,
    attempts: i32,
    last_failed_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<FailureRow> for AnalysisFailure {
    fn from(row: FailureRow) -> Self {
        Self {
            trace_id: TraceId::from_uuid(row.trace_uuid),
            reason: FailureReason::parse(&row.reason),
            error_message: row.error_message,
            attempts: row.attempts,
            last_failed_at: row.last_failed_at,
            created_at: row.created_at,
        }
    }
}

/// In-memory failure log for development and tests
#[derive(Default)]
pub struct InMemoryFailureLog {
    failures: RwLock<HashMap<TraceId, AnalysisFailure>>,
}

impl InMemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, trace_id: TraceId) -> Option<AnalysisFailure> {
        self.failures
            .read()
            .ok()
            .and_then(|failures| failures.get(&trace_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.failures.read().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl FailureLog for InMemoryFailureLog {
    async fn record(&self, failure: AnalysisFailure) -> Result<()> {
        let mut failures = self
            .failures
            .write()
            .map_err(|_| AnalyzerError::Internal("failure log lock poisoned".into()))?;

        failures
            .entry(failure.trace_id)
            .and_modify(|existing| {
                existing.reason = failure.reason;
                existing.error_message = failure.error_message.clone();
                existing.attempts += 1;
                existing.last_failed_at = failure.last_failed_at;
            })
            .or_insert(failure);

        Ok(())
    }

    async fn clear(&self, trace_id: TraceId) -> Result<bool> {
        let mut failures = self
            .failures
            .write()
            .map_err(|_| AnalyzerError::Internal("failure log lock poisoned".into()))?;
        Ok(failures.remove(&trace_id).is_some())
    }

    async fn list(&self, limit: i64) -> Result<Vec<AnalysisFailure>> {
        let failures = self
            .failures
            .read()
            .map_err(|_| AnalyzerError::Internal("failure log lock poisoned".into()))?;

        let mut list: Vec<AnalysisFailure> = failures.values().cloned().collect();
        list.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));
        list.truncate(limit.max(0) as usize);
        Ok(list)
    }
}

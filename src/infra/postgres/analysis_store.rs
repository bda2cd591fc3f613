//! PostgreSQL analysis store
//!
//! Units of work run as `REPEATABLE READ` transactions. The endpoint row is
//! locked first (`SELECT ... FOR UPDATE`), so two workers committing the
//! same endpoint either serialize or one of them fails with `40001` and
//! retries from scratch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::instrument;
use uuid::Uuid;

use crate::domain::{
    Alert, AlertKind, AlertSeverity, AlertStatus, ApiEndpoint, ApiTrace, DataClass, DataField,
    DataSection, DataTag, DataType, EndpointActivity, EndpointId, EndpointSchema, EndpointUpdate,
    RiskScore, TraceId, TraceRequest, TraceResponse,
};
use crate::infra::{AnalysisStore, AnalyzerError, Result, UnitOfWork};

/// PostgreSQL-backed analysis store
#[derive(Clone)]
pub struct PgAnalysisStore {
    pool: PgPool,
}

impl PgAnalysisStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register an endpoint; an existing (host, path, method) keeps its row
    pub async fn register_endpoint(&self, endpoint: &ApiEndpoint) -> Result<EndpointId> {
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO api_endpoints (uuid, host, path, method, risk_score, known_schema)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (host, path, method) DO UPDATE SET
                known_schema = COALESCE(EXCLUDED.known_schema, api_endpoints.known_schema)
            RETURNING uuid
            "#,
        )
        .bind(endpoint.endpoint_id.0)
        .bind(&endpoint.host)
        .bind(&endpoint.path)
        .bind(&endpoint.method)
        .bind(endpoint.risk_score.as_str())
        .bind(endpoint.known_schema.as_ref().map(Json))
        .fetch_one(&self.pool)
        .await?;

        Ok(EndpointId::from_uuid(row.0))
    }

    /// Store a captured trace
    pub async fn insert_trace(&self, trace: &ApiTrace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_traces (uuid, api_endpoint_uuid, created_at, request, response, meta, analyzed)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (uuid) DO NOTHING
            "#,
        )
        .bind(trace.trace_id.0)
        .bind(trace.endpoint_id.0)
        .bind(trace.created_at)
        .bind(Json(&trace.request))
        .bind(Json(&trace.response))
        .bind(&trace.meta)
        .bind(trace.analyzed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Oldest unanalyzed traces first
    pub async fn unanalyzed_trace_ids(&self, limit: i64) -> Result<Vec<TraceId>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT uuid FROM api_traces
            WHERE analyzed = FALSE
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| TraceId::from_uuid(r.0)).collect())
    }

    pub async fn count_unanalyzed(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM api_traces WHERE analyzed = FALSE")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Committed alerts for an endpoint
    pub async fn alerts(&self, endpoint_id: EndpointId) -> Result<Vec<Alert>> {
        let mut conn = self.pool.acquire().await?;
        fetch_alerts(&mut conn, endpoint_id).await
    }

    /// Committed data fields for an endpoint
    pub async fn data_fields(&self, endpoint_id: EndpointId) -> Result<Vec<DataField>> {
        let mut conn = self.pool.acquire().await?;
        fetch_data_fields(&mut conn, endpoint_id).await
    }
}

#[async_trait]
impl AnalysisStore for PgAnalysisStore {
    #[instrument(skip(self))]
    async fn load_trace(&self, trace_id: TraceId) -> Result<Option<ApiTrace>> {
        let row = sqlx::query_as::<_, TraceRow>(
            r#"
            SELECT uuid, api_endpoint_uuid, created_at, request, response, meta, analyzed
            FROM api_traces
            WHERE uuid = $1
            "#,
        )
        .bind(trace_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ApiTrace::from))
    }

    #[instrument(skip(self))]
    async fn load_endpoint(
        &self,
        endpoint_id: EndpointId,
        include_schema: bool,
    ) -> Result<Option<ApiEndpoint>> {
        let row = sqlx::query_as::<_, EndpointRow>(
            r#"
            SELECT uuid, host, path, method, first_detected, last_active, risk_score, known_schema
            FROM api_endpoints
            WHERE uuid = $1
            "#,
        )
        .bind(endpoint_id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut endpoint = ApiEndpoint::from(row);
        if !include_schema {
            endpoint.known_schema = None;
        }

        Ok(Some(endpoint))
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

/// A unit of work backed by one Postgres transaction
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn mark_trace_analyzed(&mut self, trace_id: TraceId) -> Result<()> {
        let result = sqlx::query("UPDATE api_traces SET analyzed = TRUE WHERE uuid = $1")
            .bind(trace_id.0)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AnalyzerError::TraceNotFound(trace_id));
        }
        Ok(())
    }

    async fn endpoint_activity(&mut self, endpoint_id: EndpointId) -> Result<EndpointActivity> {
        let row: Option<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT first_detected, last_active
            FROM api_endpoints
            WHERE uuid = $1
            FOR UPDATE
            "#,
        )
        .bind(endpoint_id.0)
        .fetch_optional(&mut *self.tx)
        .await?;

        let (first_detected, last_active) =
            row.ok_or(AnalyzerError::EndpointNotFound(endpoint_id))?;

        Ok(EndpointActivity {
            first_detected,
            last_active,
        })
    }

    async fn data_fields(&mut self, endpoint_id: EndpointId) -> Result<Vec<DataField>> {
        fetch_data_fields(&mut self.tx, endpoint_id).await
    }

    async fn upsert_data_fields(&mut self, fields: &[DataField]) -> Result<()> {
        for field in fields {
            let classes: Vec<String> = field
                .data_classes
                .iter()
                .map(|c| c.as_str().to_string())
                .collect();

            sqlx::query(
                r#"
                INSERT INTO data_fields (
                    uuid, api_endpoint_uuid, data_section, data_path,
                    data_classes, data_type, data_tag, matches, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                ON CONFLICT (api_endpoint_uuid, data_section, data_path) DO UPDATE SET
                    data_classes = EXCLUDED.data_classes,
                    data_type = EXCLUDED.data_type,
                    data_tag = EXCLUDED.data_tag,
                    matches = EXCLUDED.matches,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(field.endpoint_id.0)
            .bind(field.data_section.as_str())
            .bind(&field.data_path)
            .bind(&classes)
            .bind(field.data_type.as_str())
            .bind(field.data_tag.map(|t| t.as_str()))
            .bind(field.matches)
            .bind(field.updated_at)
            .execute(&mut *self.tx)
            .await?;
        }
        Ok(())
    }

    async fn insert_alerts(&mut self, alerts: &[Alert]) -> Result<u64> {
        let mut inserted = 0;
        for alert in alerts {
            let result = sqlx::query(
                r#"
                INSERT INTO alerts (
                    uuid, api_endpoint_uuid, kind, locator, severity, status,
                    description, context, data_section, data_path, trace_uuid, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                ON CONFLICT (api_endpoint_uuid, kind, locator) DO NOTHING
                "#,
            )
            .bind(alert.alert_id)
            .bind(alert.endpoint_id.0)
            .bind(alert.kind.as_str())
            .bind(&alert.locator)
            .bind(alert.severity.as_str())
            .bind(alert.status.as_str())
            .bind(&alert.description)
            .bind(&alert.context)
            .bind(alert.data_section.map(|s| s.as_str()))
            .bind(alert.data_path.as_deref())
            .bind(alert.trace_id.map(|t| t.0))
            .bind(alert.created_at)
            .execute(&mut *self.tx)
            .await?;

            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn alerts(&mut self, endpoint_id: EndpointId) -> Result<Vec<Alert>> {
        fetch_alerts(&mut self.tx, endpoint_id).await
    }

    async fn update_endpoint(&mut self, update: &EndpointUpdate) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE api_endpoints
            SET first_detected = $2,
                last_active = $3,
                risk_score = $4,
                updated_at = NOW()
            WHERE uuid = $1
            "#,
        )
        .bind(update.endpoint_id.0)
        .bind(update.first_detected)
        .bind(update.last_active)
        .bind(update.risk_score.as_str())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AnalyzerError::EndpointNotFound(update.endpoint_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

async fn fetch_data_fields(
    conn: &mut sqlx::PgConnection,
    endpoint_id: EndpointId,
) -> Result<Vec<DataField>> {
    let rows = sqlx::query_as::<_, DataFieldRow>(
        r#"
        SELECT api_endpoint_uuid, data_section, data_path, data_classes,
               data_type, data_tag, matches, updated_at
        FROM data_fields
        WHERE api_endpoint_uuid = $1
        ORDER BY data_section, data_path
        "#,
    )
    .bind(endpoint_id.0)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(DataField::try_from).collect()
}

async fn fetch_alerts(conn: &mut sqlx::PgConnection, endpoint_id: EndpointId) -> Result<Vec<Alert>> {
    let rows = sqlx::query_as::<_, AlertRow>(
        r#"
        SELECT uuid, api_endpoint_uuid, kind, locator, severity, status, description,
               context, data_section, data_path, trace_uuid, created_at
        FROM alerts
        WHERE api_endpoint_uuid = $1
        ORDER BY kind, locator
        "#,
    )
    .bind(endpoint_id.0)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(Alert::try_from).collect()
}

fn unknown(column: &str, value: &str) -> AnalyzerError {
    AnalyzerError::Internal(format!("unknown {} '{}' in stored row", column, value))
}

#[derive(Debug, sqlx::FromRow)]
struct TraceRow {
    uuid: Uuid,
    api_endpoint_uuid: Uuid,
    created_at: DateTime<Utc>,
    request: Json<TraceRequest>,
    response: Json<TraceResponse>,
    meta: Option<serde_json::Value>,
    analyzed: bool,
}

impl From<TraceRow> for ApiTrace {
    fn from(row: TraceRow) -> Self {
        Self {
            trace_id: TraceId::from_uuid(row.uuid),
            endpoint_id: EndpointId::from_uuid(row.api_endpoint_uuid),
            created_at: row.created_at,
            request: row.request.0,
            response: row.response.0,
            meta: row.meta,
            analyzed: row.analyzed,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EndpointRow {
    uuid: Uuid,
    host: String,
    path: String,
    method: String,
    first_detected: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
    risk_score: String,
    known_schema: Option<Json<EndpointSchema>>,
}

impl From<EndpointRow> for ApiEndpoint {
    fn from(row: EndpointRow) -> Self {
        Self {
            endpoint_id: EndpointId::from_uuid(row.uuid),
            host: row.host,
            path: row.path,
            method: row.method,
            first_detected: row.first_detected,
            last_active: row.last_active,
            risk_score: RiskScore::parse(&row.risk_score).unwrap_or_default(),
            known_schema: row.known_schema.map(|s| s.0),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DataFieldRow {
    api_endpoint_uuid: Uuid,
    data_section: String,
    data_path: String,
    data_classes: Vec<String>,
    data_type: String,
    data_tag: Option<String>,
    matches: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DataFieldRow> for DataField {
    type Error = AnalyzerError;

    fn try_from(row: DataFieldRow) -> Result<Self> {
        let data_section = DataSection::parse(&row.data_section)
            .ok_or_else(|| unknown("data_section", &row.data_section))?;
        let data_type =
            DataType::parse(&row.data_type).ok_or_else(|| unknown("data_type", &row.data_type))?;
        let data_classes = row
            .data_classes
            .iter()
            .map(|c| DataClass::parse(c).ok_or_else(|| unknown("data_class", c)))
            .collect::<Result<_>>()?;

        Ok(Self {
            endpoint_id: EndpointId::from_uuid(row.api_endpoint_uuid),
            data_section,
            data_path: row.data_path,
            data_classes,
            data_type,
            data_tag: row.data_tag.as_deref().and_then(DataTag::parse),
            matches: row.matches,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AlertRow {
    uuid: Uuid,
    api_endpoint_uuid: Uuid,
    kind: String,
    locator: String,
    severity: String,
    status: String,
    description: String,
    context: serde_json::Value,
    data_section: Option<String>,
    data_path: Option<String>,
    trace_uuid: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertRow> for Alert {
    type Error = AnalyzerError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Self {
            alert_id: row.uuid,
            endpoint_id: EndpointId::from_uuid(row.api_endpoint_uuid),
            kind: AlertKind::parse(&row.kind).ok_or_else(|| unknown("kind", &row.kind))?,
            locator: row.locator,
            severity: AlertSeverity::parse(&row.severity)
                .ok_or_else(|| unknown("severity", &row.severity))?,
            status: AlertStatus::parse(&row.status)
                .ok_or_else(|| unknown("status", &row.status))?,
            description: row.description,
            context: row.context,
            data_section: row.data_section.as_deref().and_then(DataSection::parse),
            data_path: row.data_path,
            trace_id: row.trace_uuid.map(TraceId::from_uuid),
            created_at: row.created_at,
        })
    }
}

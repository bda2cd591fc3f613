//! Transactional committer
//!
//! Merges a [`TraceAnalysis`] with durable state inside one unit of work:
//! data field upserts, alert inserts, the endpoint aggregate and the trace's
//! analyzed flag land together or not at all. Transient failures re-run the
//! whole unit from a fresh read.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::analysis::{advance_activity, RiskPolicy, TraceAnalysis};
use crate::domain::{DataField, DataFieldKey, EndpointUpdate, RiskScore};
use crate::infra::{AnalysisStore, AnalyzerError, Result, Retry, RetryConfig, UnitOfWork};

/// Default number of commit attempts, the first one included
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// What a successful commit wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Alerts newly inserted (duplicates of existing alerts are not counted)
    pub alerts_inserted: u64,
    /// Attempts made, 1 when the first attempt committed
    pub attempts: u32,
    pub risk_score: RiskScore,
}

impl CommitOutcome {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Applies analyses atomically with bounded retries
pub struct Committer {
    store: Arc<dyn AnalysisStore>,
    retry: Retry,
    risk: RiskPolicy,
}

impl Committer {
    pub fn new(store: Arc<dyn AnalysisStore>, retry: RetryConfig, risk: RiskPolicy) -> Self {
        Self {
            store,
            retry: Retry::new(retry),
            risk,
        }
    }

    /// Retry policy for database-backed stores, allowing `max_attempts` tries
    pub fn retry_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::database().with_max_retries(max_attempts.max(1) - 1)
    }

    /// Commit an analysis
    ///
    /// Returns `ExhaustedRetries` when every attempt failed transiently; any
    /// permanent error is returned as-is after the first failing attempt.
    pub async fn commit(&self, analysis: &TraceAnalysis) -> Result<CommitOutcome> {
        let outcome = self
            .retry
            .run_with_predicate(|| self.attempt(analysis), AnalyzerError::is_retryable)
            .await;
        let attempts = outcome.attempts;

        match outcome.result {
            Ok((alerts_inserted, risk_score)) => {
                if attempts > 1 {
                    debug!(
                        trace_id = %analysis.trace_id,
                        attempts,
                        "Commit succeeded after retries"
                    );
                }
                Ok(CommitOutcome {
                    alerts_inserted,
                    attempts,
                    risk_score,
                })
            }
            Err(e) if e.is_retryable() => Err(AnalyzerError::ExhaustedRetries {
                attempts,
                source: Box::new(e),
            }),
            Err(e) => Err(e),
        }
    }

    /// One attempt: begin, apply, commit. Any failure rolls the unit back.
    async fn attempt(&self, analysis: &TraceAnalysis) -> Result<(u64, RiskScore)> {
        let mut unit = self.store.begin().await?;

        match self.apply(unit.as_mut(), analysis).await {
            Ok(written) => {
                unit.commit().await?;
                Ok(written)
            }
            Err(e) => {
                if let Err(rollback_err) = unit.rollback().await {
                    warn!(
                        trace_id = %analysis.trace_id,
                        error = %rollback_err,
                        "Rollback failed; discarding unit"
                    );
                }
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        unit: &mut dyn UnitOfWork,
        analysis: &TraceAnalysis,
    ) -> Result<(u64, RiskScore)> {
        let endpoint_id = analysis.endpoint_id;

        // Reads first; the unit locks the endpoint for the rest of the attempt.
        let activity = unit.endpoint_activity(endpoint_id).await?;
        let mut fields: BTreeMap<DataFieldKey, DataField> = unit
            .data_fields(endpoint_id)
            .await?
            .into_iter()
            .map(|field| (field.key(), field))
            .collect();

        let now = Utc::now();
        let merged: Vec<DataField> = analysis
            .fields()
            .map(|observed| {
                let key = DataFieldKey {
                    endpoint_id,
                    section: observed.section,
                    path: observed.path.clone(),
                };
                observed.merge_into(endpoint_id, fields.get(&key), now)
            })
            .collect();

        unit.upsert_data_fields(&merged).await?;
        let alerts_inserted = unit.insert_alerts(&analysis.alerts).await?;

        for field in merged {
            fields.insert(field.key(), field);
        }
        let fields: Vec<DataField> = fields.into_values().collect();
        let alerts = unit.alerts(endpoint_id).await?;
        let risk_score = self.risk.score(&fields, &alerts);

        let (first_detected, last_active) = advance_activity(activity, analysis.observed_at);
        unit.update_endpoint(&EndpointUpdate {
            endpoint_id,
            first_detected,
            last_active,
            risk_score,
        })
        .await?;

        unit.mark_trace_analyzed(analysis.trace_id).await?;

        Ok((alerts_inserted, risk_score))
    }
}

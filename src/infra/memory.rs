//! In-memory queue and store for development and tests
//!
//! The store gives each unit of work a snapshot at `begin` and buffers its
//! writes. Commit applies the buffered writes only if no endpoint the unit
//! touched was committed by someone else in the meantime; otherwise it fails
//! with a retryable `Conflict`, the same way a `REPEATABLE READ` transaction
//! fails with a serialization error.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::domain::{
    Alert, AlertKey, AlertStatus, ApiEndpoint, ApiTrace, DataField, DataFieldKey,
    EndpointActivity, EndpointId, EndpointUpdate, TraceId,
};
use crate::infra::{AnalysisStore, AnalyzerError, QueueSource, Result, UnitOfWork};

/// In-memory trace queue (FIFO of raw tokens)
#[derive(Default)]
pub struct InMemoryTraceQueue {
    items: Mutex<VecDeque<String>>,
    pops: AtomicU64,
    empty_pops: AtomicU64,
}

impl InMemoryTraceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, trace_id: TraceId) {
        self.push_raw(trace_id.to_string());
    }

    /// Push an arbitrary token, valid or not
    pub fn push_raw(&self, token: impl Into<String>) {
        if let Ok(mut items) = self.items.lock() {
            items.push_back(token.into());
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total pops, including pops of an empty queue
    pub fn pops(&self) -> u64 {
        self.pops.load(Ordering::SeqCst)
    }

    pub fn empty_pops(&self) -> u64 {
        self.empty_pops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueSource for InMemoryTraceQueue {
    async fn pop_next(&self) -> Result<Option<TraceId>> {
        self.pops.fetch_add(1, Ordering::SeqCst);

        let token = self
            .items
            .lock()
            .map_err(|_| AnalyzerError::Internal("queue lock poisoned".into()))?
            .pop_front();

        match token {
            Some(token) => TraceId::parse(&token)
                .map(Some)
                .ok_or(AnalyzerError::InvalidTraceId(token)),
            None => {
                self.empty_pops.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct State {
    traces: HashMap<TraceId, ApiTrace>,
    endpoints: HashMap<EndpointId, ApiEndpoint>,
    data_fields: BTreeMap<DataFieldKey, DataField>,
    alerts: BTreeMap<AlertKey, Alert>,
    /// Bumped on every committed write touching an endpoint
    versions: HashMap<EndpointId, u64>,
}

#[derive(Default)]
struct Shared {
    state: State,
    transient_failures: u32,
    permanent_failures: u32,
    commit_attempts: u64,
    commits: u64,
}

/// In-memory analysis store
#[derive(Clone, Default)]
pub struct InMemoryAnalysisStore {
    shared: Arc<Mutex<Shared>>,
}

impl InMemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Shared>> {
        lock(&self.shared)
    }

    /// Register an endpoint
    pub fn insert_endpoint(&self, endpoint: ApiEndpoint) -> Result<()> {
        self.lock()?
            .state
            .endpoints
            .insert(endpoint.endpoint_id, endpoint);
        Ok(())
    }

    /// Store a captured trace
    pub fn insert_trace(&self, trace: ApiTrace) -> Result<()> {
        self.lock()?.state.traces.insert(trace.trace_id, trace);
        Ok(())
    }

    pub fn trace(&self, trace_id: TraceId) -> Option<ApiTrace> {
        self.lock().ok()?.state.traces.get(&trace_id).cloned()
    }

    pub fn endpoint(&self, endpoint_id: EndpointId) -> Option<ApiEndpoint> {
        self.lock().ok()?.state.endpoints.get(&endpoint_id).cloned()
    }

    pub fn data_fields(&self, endpoint_id: EndpointId) -> Vec<DataField> {
        self.lock()
            .map(|shared| fields_of(&shared.state, endpoint_id))
            .unwrap_or_default()
    }

    pub fn alerts(&self, endpoint_id: EndpointId) -> Vec<Alert> {
        self.lock()
            .map(|shared| alerts_of(&shared.state, endpoint_id))
            .unwrap_or_default()
    }

    /// Change an alert's status, as an operator would
    pub fn set_alert_status(&self, key: &AlertKey, status: AlertStatus) -> Result<bool> {
        let mut shared = self.lock()?;
        match shared.state.alerts.get_mut(key) {
            Some(alert) => {
                alert.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fail the next `count` commits with a retryable conflict
    pub fn inject_commit_failures(&self, count: u32) -> Result<()> {
        self.lock()?.transient_failures = count;
        Ok(())
    }

    /// Fail the next commit with a permanent error
    pub fn inject_permanent_commit_failure(&self) -> Result<()> {
        self.lock()?.permanent_failures = 1;
        Ok(())
    }

    /// Commits attempted, successful or not
    pub fn commit_attempts(&self) -> u64 {
        self.lock().map(|s| s.commit_attempts).unwrap_or(0)
    }

    pub fn commits(&self) -> u64 {
        self.lock().map(|s| s.commits).unwrap_or(0)
    }

    pub fn unanalyzed(&self) -> Vec<TraceId> {
        let mut ids: Vec<TraceId> = self
            .lock()
            .map(|s| {
                s.state
                    .traces
                    .values()
                    .filter(|t| !t.analyzed)
                    .map(|t| t.trace_id)
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }
}

fn lock(shared: &Arc<Mutex<Shared>>) -> Result<MutexGuard<'_, Shared>> {
    shared
        .lock()
        .map_err(|_| AnalyzerError::Internal("store lock poisoned".into()))
}

fn fields_of(state: &State, endpoint_id: EndpointId) -> Vec<DataField> {
    state
        .data_fields
        .values()
        .filter(|f| f.endpoint_id == endpoint_id)
        .cloned()
        .collect()
}

fn alerts_of(state: &State, endpoint_id: EndpointId) -> Vec<Alert> {
    state
        .alerts
        .values()
        .filter(|a| a.endpoint_id == endpoint_id)
        .cloned()
        .collect()
}

#[async_trait]
impl AnalysisStore for InMemoryAnalysisStore {
    async fn load_trace(&self, trace_id: TraceId) -> Result<Option<ApiTrace>> {
        Ok(self.lock()?.state.traces.get(&trace_id).cloned())
    }

    async fn load_endpoint(
        &self,
        endpoint_id: EndpointId,
        include_schema: bool,
    ) -> Result<Option<ApiEndpoint>> {
        let endpoint = self.lock()?.state.endpoints.get(&endpoint_id).cloned();

        Ok(endpoint.map(|mut endpoint| {
            if !include_schema {
                endpoint.known_schema = None;
            }
            endpoint
        }))
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let snapshot = self.lock()?.state.clone();
        Ok(Box::new(InMemoryUnit {
            shared: self.shared.clone(),
            snapshot,
            touched: BTreeSet::new(),
            analyzed: BTreeSet::new(),
            fields: BTreeMap::new(),
            alerts: BTreeMap::new(),
            endpoint_updates: BTreeMap::new(),
        }))
    }
}

/// Buffered writes over a snapshot
struct InMemoryUnit {
    shared: Arc<Mutex<Shared>>,
    snapshot: State,
    touched: BTreeSet<EndpointId>,
    analyzed: BTreeSet<TraceId>,
    fields: BTreeMap<DataFieldKey, DataField>,
    alerts: BTreeMap<AlertKey, Alert>,
    endpoint_updates: BTreeMap<EndpointId, EndpointUpdate>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnit {
    async fn mark_trace_analyzed(&mut self, trace_id: TraceId) -> Result<()> {
        if !self.snapshot.traces.contains_key(&trace_id) {
            return Err(AnalyzerError::TraceNotFound(trace_id));
        }
        self.analyzed.insert(trace_id);
        Ok(())
    }

    async fn endpoint_activity(&mut self, endpoint_id: EndpointId) -> Result<EndpointActivity> {
        self.touched.insert(endpoint_id);

        if let Some(update) = self.endpoint_updates.get(&endpoint_id) {
            return Ok(EndpointActivity {
                first_detected: Some(update.first_detected),
                last_active: Some(update.last_active),
            });
        }

        self.snapshot
            .endpoints
            .get(&endpoint_id)
            .map(ApiEndpoint::activity)
            .ok_or(AnalyzerError::EndpointNotFound(endpoint_id))
    }

    async fn data_fields(&mut self, endpoint_id: EndpointId) -> Result<Vec<DataField>> {
        self.touched.insert(endpoint_id);

        let mut merged: BTreeMap<DataFieldKey, DataField> = self
            .snapshot
            .data_fields
            .iter()
            .filter(|(k, _)| k.endpoint_id == endpoint_id)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, field) in &self.fields {
            if key.endpoint_id == endpoint_id {
                merged.insert(key.clone(), field.clone());
            }
        }
        Ok(merged.into_values().collect())
    }

    async fn upsert_data_fields(&mut self, fields: &[DataField]) -> Result<()> {
        for field in fields {
            self.touched.insert(field.endpoint_id);
            self.fields.insert(field.key(), field.clone());
        }
        Ok(())
    }

    async fn insert_alerts(&mut self, alerts: &[Alert]) -> Result<u64> {
        let mut inserted = 0;
        for alert in alerts {
            self.touched.insert(alert.endpoint_id);
            let key = alert.key();
            if self.snapshot.alerts.contains_key(&key) || self.alerts.contains_key(&key) {
                continue;
            }
            self.alerts.insert(key, alert.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn alerts(&mut self, endpoint_id: EndpointId) -> Result<Vec<Alert>> {
        self.touched.insert(endpoint_id);

        let mut all = alerts_of(&self.snapshot, endpoint_id);
        all.extend(
            self.alerts
                .values()
                .filter(|a| a.endpoint_id == endpoint_id)
                .cloned(),
        );
        Ok(all)
    }

    async fn update_endpoint(&mut self, update: &EndpointUpdate) -> Result<()> {
        if !self.snapshot.endpoints.contains_key(&update.endpoint_id) {
            return Err(AnalyzerError::EndpointNotFound(update.endpoint_id));
        }
        self.touched.insert(update.endpoint_id);
        self.endpoint_updates
            .insert(update.endpoint_id, update.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let unit = *self;
        let mut shared = lock(&unit.shared)?;
        shared.commit_attempts += 1;

        if shared.permanent_failures > 0 {
            shared.permanent_failures -= 1;
            return Err(AnalyzerError::Internal("injected commit failure".into()));
        }
        if shared.transient_failures > 0 {
            shared.transient_failures -= 1;
            return Err(AnalyzerError::Conflict("injected commit conflict".into()));
        }

        for endpoint_id in &unit.touched {
            let seen = unit.snapshot.versions.get(endpoint_id).copied().unwrap_or(0);
            let current = shared.state.versions.get(endpoint_id).copied().unwrap_or(0);
            if seen != current {
                return Err(AnalyzerError::Conflict(format!(
                    "endpoint {} changed since unit began",
                    endpoint_id
                )));
            }
        }

        let state = &mut shared.state;
        for trace_id in &unit.analyzed {
            if let Some(trace) = state.traces.get_mut(trace_id) {
                trace.analyzed = true;
            }
        }
        for (key, field) in unit.fields {
            state.data_fields.insert(key, field);
        }
        for (key, alert) in unit.alerts {
            state.alerts.entry(key).or_insert(alert);
        }
        for (endpoint_id, update) in unit.endpoint_updates {
            if let Some(endpoint) = state.endpoints.get_mut(&endpoint_id) {
                endpoint.first_detected = Some(update.first_detected);
                endpoint.last_active = Some(update.last_active);
                endpoint.risk_score = update.risk_score;
            }
        }
        for endpoint_id in unit.touched {
            *state.versions.entry(endpoint_id).or_insert(0) += 1;
        }

        shared.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

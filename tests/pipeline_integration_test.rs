//! End-to-end pipeline tests against the in-memory queue and store.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::*;
use trace_analyzer::domain::{
    AlertKind, AlertStatus, DataClass, DataSection, DataTag, RiskScore, TraceId,
};
use trace_analyzer::infra::{FailureLog, FailureReason, ShutdownCoordinator};
use trace_analyzer::metrics::metric_names;
use trace_analyzer::pipeline::TraceOutcome;

#[tokio::test]
async fn first_trace_creates_field_alert_and_activity() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    let trace = email_trace(&endpoint, t1());
    harness.enqueue(&trace);

    let outcomes = harness.drain().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        TraceOutcome::Analyzed {
            alerts_inserted: 1,
            attempts: 1,
            ..
        }
    ));

    let fields = harness.store.data_fields(endpoint.endpoint_id);
    assert_eq!(fields.len(), 1);
    let field = &fields[0];
    assert_eq!(field.data_section, DataSection::RequestBody);
    assert_eq!(field.data_path, "email");
    assert_eq!(
        field.data_classes,
        BTreeSet::from([DataClass::PersonalIdentifier])
    );
    assert_eq!(field.data_tag, Some(DataTag::Pii));
    assert_eq!(field.matches, 1);

    let alerts = harness.store.alerts(endpoint.endpoint_id);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::SensitiveData);
    assert_eq!(alerts[0].status, AlertStatus::Open);
    assert_eq!(alerts[0].trace_id, Some(trace.trace_id));

    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.first_detected, Some(t1()));
    assert_eq!(stored.last_active, Some(t1()));
    assert!(stored.risk_score > RiskScore::None);

    assert!(harness.store.trace(trace.trace_id).unwrap().analyzed);
}

#[tokio::test]
async fn second_trace_bumps_matches_without_new_alert() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    harness.enqueue(&email_trace(&endpoint, t1()));
    harness.drain().await;
    let risk_after_first = harness
        .store
        .endpoint(endpoint.endpoint_id)
        .unwrap()
        .risk_score;

    harness.enqueue(&email_trace(&endpoint, t2()));
    let outcomes = harness.drain().await;
    assert!(matches!(
        outcomes[0],
        TraceOutcome::Analyzed {
            alerts_inserted: 0,
            ..
        }
    ));

    let fields = harness.store.data_fields(endpoint.endpoint_id);
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].matches, 2);
    assert_eq!(harness.store.alerts(endpoint.endpoint_id).len(), 1);

    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.first_detected, Some(t1()));
    assert_eq!(stored.last_active, Some(t2()));
    assert_eq!(stored.risk_score, risk_after_first);
}

#[tokio::test]
async fn out_of_order_traces_keep_activity_window_monotone() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    harness.enqueue(&email_trace(&endpoint, t2()));
    harness.enqueue(&email_trace(&endpoint, t1()));
    harness.drain().await;

    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.first_detected, Some(t1()));
    assert_eq!(stored.last_active, Some(t2()));
}

#[tokio::test]
async fn processing_a_trace_twice_keeps_sets_and_bumps_counters() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    let trace = busy_trace(&endpoint, t1());
    harness.enqueue(&trace);
    harness.drain().await;

    let keys = |h: &Harness| -> (BTreeSet<_>, BTreeSet<_>) {
        (
            h.store
                .data_fields(endpoint.endpoint_id)
                .iter()
                .map(|f| (f.key(), f.data_classes.clone()))
                .collect(),
            h.store
                .alerts(endpoint.endpoint_id)
                .iter()
                .map(|a| a.key())
                .collect(),
        )
    };
    let (fields_once, alerts_once) = keys(&harness);
    let endpoint_once = harness.store.endpoint(endpoint.endpoint_id).unwrap();

    // at-least-once delivery: the same id arrives again
    harness.queue.push(trace.trace_id);
    harness.drain().await;

    let (fields_twice, alerts_twice) = keys(&harness);
    assert_eq!(fields_once, fields_twice);
    assert_eq!(alerts_once, alerts_twice);

    let endpoint_twice = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(endpoint_once.first_detected, endpoint_twice.first_detected);
    assert_eq!(endpoint_once.last_active, endpoint_twice.last_active);
    assert_eq!(endpoint_once.risk_score, endpoint_twice.risk_score);

    assert!(harness
        .store
        .data_fields(endpoint.endpoint_id)
        .iter()
        .all(|f| f.matches == 2));
}

#[tokio::test]
async fn busy_trace_classifies_every_section() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);
    harness.enqueue(&busy_trace(&endpoint, t1()));
    harness.drain().await;

    let classes_at = |section: DataSection, path: &str| {
        harness
            .store
            .data_fields(endpoint.endpoint_id)
            .into_iter()
            .find(|f| f.data_section == section && f.data_path == path)
            .map(|f| f.data_classes)
            .unwrap_or_default()
    };

    assert!(classes_at(DataSection::RequestBody, "user.email")
        .contains(&DataClass::PersonalIdentifier));
    assert!(classes_at(DataSection::RequestBody, "card").contains(&DataClass::Financial));
    assert!(classes_at(DataSection::RequestBody, "password").contains(&DataClass::Credential));
    assert!(classes_at(DataSection::RequestHeaders, "authorization")
        .contains(&DataClass::Credential));
    assert!(classes_at(DataSection::RequestQuery, "session_id").contains(&DataClass::Credential));
    assert!(classes_at(DataSection::ResponseHeaders, "x-forwarded-for")
        .contains(&DataClass::NetworkIdentifier));
    assert!(classes_at(DataSection::RequestBody, "tags[]").is_empty());

    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.risk_score, RiskScore::High);
}

#[tokio::test]
async fn schema_drift_raises_one_alert_per_deviation() {
    let harness = Harness::new();
    let endpoint = contracted_endpoint();
    harness.endpoint(&endpoint);

    // name has the wrong type, email is missing, nickname is new
    let trace = json_trace(&endpoint, json!({ "name": 42, "nickname": "jj" }), t1());
    harness.enqueue(&trace);
    harness.drain().await;

    let drift: BTreeSet<String> = harness
        .store
        .alerts(endpoint.endpoint_id)
        .into_iter()
        .filter(|a| a.kind == AlertKind::SchemaDrift)
        .map(|a| a.locator)
        .collect();
    assert_eq!(drift.len(), 3);
    assert!(drift.iter().any(|l| l.contains("nickname")));
    assert!(drift.iter().any(|l| l.contains("email")));
    assert!(drift.iter().any(|l| l.contains("name") && l.contains("type_mismatch")));

    // the same deviations again raise nothing new
    harness.enqueue(&json_trace(
        &endpoint,
        json!({ "name": 7, "nickname": "kk" }),
        t2(),
    ));
    let outcomes = harness.drain().await;
    assert!(matches!(
        outcomes[0],
        TraceOutcome::Analyzed {
            alerts_inserted: 0,
            ..
        }
    ));
}

#[tokio::test]
async fn conforming_trace_raises_no_drift() {
    let harness = Harness::new();
    let endpoint = contracted_endpoint();
    harness.endpoint(&endpoint);

    harness.enqueue(&json_trace(
        &endpoint,
        json!({ "email": "x@y.io", "name": "X" }),
        t1(),
    ));
    harness.drain().await;

    assert!(harness
        .store
        .alerts(endpoint.endpoint_id)
        .iter()
        .all(|a| a.kind != AlertKind::SchemaDrift));
}

#[tokio::test]
async fn empty_body_object_is_missing_required_field() {
    let harness = Harness::new();
    let endpoint = contracted_endpoint();
    harness.endpoint(&endpoint);

    harness.enqueue(&json_trace(&endpoint, json!({}), t1()));
    harness.drain().await;

    let drift: Vec<String> = harness
        .store
        .alerts(endpoint.endpoint_id)
        .into_iter()
        .filter(|a| a.kind == AlertKind::SchemaDrift)
        .map(|a| a.locator)
        .collect();
    assert_eq!(drift, vec!["req_body:email:missing_required_field".to_string()]);
}

#[tokio::test]
async fn resolved_alert_is_not_reopened() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    harness.enqueue(&email_trace(&endpoint, t1()));
    harness.drain().await;

    let alert = harness.store.alerts(endpoint.endpoint_id).remove(0);
    assert!(harness
        .store
        .set_alert_status(&alert.key(), AlertStatus::Resolved)
        .unwrap());

    harness.enqueue(&email_trace(&endpoint, t2()));
    harness.drain().await;

    let alerts = harness.store.alerts(endpoint.endpoint_id);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].status, AlertStatus::Resolved);
}

#[tokio::test]
async fn repeated_empty_pops_do_nothing() {
    let harness = Harness::new();
    let runner = harness.runner("idle");

    for _ in 0..5 {
        assert_eq!(runner.run_once().await.unwrap(), None);
    }

    let stats = runner.stats().await;
    assert_eq!(stats.empty_polls, 5);
    assert_eq!(stats.processed, 0);
    assert_eq!(harness.store.commit_attempts(), 0);
    assert_eq!(
        harness
            .metrics
            .get_counter(metric_names::QUEUE_EMPTY_POLLS)
            .await,
        5
    );
}

#[tokio::test]
async fn five_transient_failures_leave_no_partial_rows() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);
    let trace = email_trace(&endpoint, t1());
    harness.enqueue(&trace);

    harness.store.inject_commit_failures(5).unwrap();
    let outcomes = harness.drain().await;

    assert_eq!(
        outcomes,
        vec![TraceOutcome::Failed {
            trace_id: Some(trace.trace_id),
            reason: FailureReason::ExhaustedRetries,
        }]
    );
    assert_eq!(harness.store.commit_attempts(), 5);
    assert!(harness.store.data_fields(endpoint.endpoint_id).is_empty());
    assert!(harness.store.alerts(endpoint.endpoint_id).is_empty());
    assert!(!harness.store.trace(trace.trace_id).unwrap().analyzed);

    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.first_detected, None);
    assert_eq!(stored.risk_score, RiskScore::None);

    let failure = harness.failures.get(trace.trace_id).unwrap();
    assert_eq!(failure.reason, FailureReason::ExhaustedRetries);
}

#[tokio::test]
async fn transient_failures_below_budget_commit_once() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);
    harness.enqueue(&email_trace(&endpoint, t1()));

    harness.store.inject_commit_failures(4).unwrap();
    let outcomes = harness.drain().await;

    assert!(matches!(
        outcomes[0],
        TraceOutcome::Analyzed { attempts: 5, .. }
    ));
    assert_eq!(harness.store.commits(), 1);
    assert_eq!(harness.store.data_fields(endpoint.endpoint_id).len(), 1);
    assert_eq!(
        harness
            .metrics
            .get_counter(metric_names::COMMIT_RETRIES)
            .await,
        4
    );
}

#[tokio::test]
async fn failed_trace_succeeds_on_redelivery_and_clears_failure() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);
    let trace = email_trace(&endpoint, t1());
    harness.enqueue(&trace);

    harness.store.inject_permanent_commit_failure().unwrap();
    harness.drain().await;
    assert!(harness.failures.get(trace.trace_id).is_some());

    harness.queue.push(trace.trace_id);
    harness.drain().await;

    assert!(harness.store.trace(trace.trace_id).unwrap().analyzed);
    assert!(harness.failures.get(trace.trace_id).is_none());
}

#[tokio::test]
async fn missing_trace_and_unregistered_endpoint_are_skipped() {
    let harness = Harness::new();
    let orphan_endpoint = signup_endpoint();
    let orphan = email_trace(&orphan_endpoint, t1());
    harness.enqueue(&orphan);

    let missing = TraceId::new();
    harness.queue.push(missing);

    let outcomes = harness.drain().await;
    assert_eq!(
        outcomes,
        vec![
            TraceOutcome::Skipped {
                trace_id: Some(orphan.trace_id),
                reason: "endpoint_not_found",
            },
            TraceOutcome::Skipped {
                trace_id: Some(missing),
                reason: "trace_not_found",
            },
        ]
    );
    assert!(harness.failures.is_empty());
    assert_eq!(harness.store.commit_attempts(), 0);
    assert_eq!(
        harness
            .metrics
            .get_counter(metric_names::TRACES_SKIPPED)
            .await,
        2
    );
}

#[tokio::test]
async fn malformed_payload_is_recorded_and_loop_continues() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    let bad = raw_trace(&endpoint, &deeply_nested_body(100), t1());
    let good = email_trace(&endpoint, t2());
    harness.enqueue(&bad);
    harness.enqueue(&good);

    let outcomes = harness.drain().await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(
        outcomes[0],
        TraceOutcome::Failed {
            trace_id: Some(bad.trace_id),
            reason: FailureReason::MalformedPayload,
        }
    );
    assert!(matches!(outcomes[1], TraceOutcome::Analyzed { .. }));

    let failures = harness.failures.list(10).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].trace_id, bad.trace_id);
    assert!(!harness.store.trace(bad.trace_id).unwrap().analyzed);

    // the failed trace left no rows behind; only the good trace's field exists
    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.first_detected, Some(t2()));
}

#[tokio::test]
async fn body_past_parser_recursion_limit_is_malformed() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    let bad = raw_trace(&endpoint, &deeply_nested_body(200), t1());
    harness.enqueue(&bad);

    let outcomes = harness.drain().await;
    assert_eq!(
        outcomes,
        vec![TraceOutcome::Failed {
            trace_id: Some(bad.trace_id),
            reason: FailureReason::MalformedPayload,
        }]
    );
    assert!(!harness.store.trace(bad.trace_id).unwrap().analyzed);
    assert!(harness.store.data_fields(endpoint.endpoint_id).is_empty());
}

#[tokio::test]
async fn non_json_body_is_one_string_field() {
    let harness = Harness::new();
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);
    harness.enqueue(&raw_trace(&endpoint, "jane@example.com", t1()));
    harness.drain().await;

    let fields = harness.store.data_fields(endpoint.endpoint_id);
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].data_path, "");
    assert!(fields[0]
        .data_classes
        .contains(&DataClass::PersonalIdentifier));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_converge_on_one_endpoint() {
    let harness = Arc::new(Harness::new());
    let endpoint = signup_endpoint();
    harness.endpoint(&endpoint);

    let traces = 24;
    let mut enqueued = Vec::new();
    for i in 0..traces {
        let at = t1() + chrono::Duration::minutes(i);
        let trace = email_trace(&endpoint, at);
        harness.enqueue(&trace);
        enqueued.push(trace);
    }

    let coordinator = ShutdownCoordinator::new();
    let mut workers = Vec::new();
    for w in 0..4 {
        let runner = harness
            .runner(&format!("worker-{w}"))
            .with_in_flight(coordinator.in_flight());
        let signal = coordinator.signal();
        workers.push(tokio::spawn(async move { runner.run(signal).await }));
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !harness.queue.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(coordinator.graceful_shutdown(Duration::from_secs(5)).await);

    let mut analyzed = 0;
    for worker in workers {
        analyzed += worker.await.unwrap().analyzed;
    }

    // Conflicting commits are retried; under heavy contention a trace may
    // exhaust its budget and stay unanalyzed, but nothing is half-written.
    let unanalyzed = harness.store.unanalyzed().len() as u64;
    assert_eq!(analyzed + unanalyzed, traces as u64);

    let fields = harness.store.data_fields(endpoint.endpoint_id);
    assert_eq!(fields.len(), 1);
    assert_eq!(fields[0].matches, analyzed as i64);
    assert_eq!(harness.store.alerts(endpoint.endpoint_id).len(), 1);

    // no lost updates: the window spans exactly the committed traces
    let pending: BTreeSet<TraceId> = harness.store.unanalyzed().into_iter().collect();
    let committed: Vec<_> = enqueued
        .iter()
        .filter(|t| !pending.contains(&t.trace_id))
        .map(|t| t.created_at)
        .collect();

    let stored = harness.store.endpoint(endpoint.endpoint_id).unwrap();
    assert_eq!(stored.first_detected, committed.iter().min().copied());
    assert_eq!(stored.last_active, committed.iter().max().copied());
}

#[tokio::test]
async fn shutdown_interrupts_idle_worker() {
    let harness = Harness::new();
    let runner = harness.runner("sleepy");
    let coordinator = ShutdownCoordinator::new();
    let signal = coordinator.signal();

    let worker = tokio::spawn(async move { runner.run(signal).await });
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert!(coordinator.graceful_shutdown(Duration::from_secs(1)).await);
    let stats = tokio::time::timeout(Duration::from_secs(1), worker)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.processed, 0);
}

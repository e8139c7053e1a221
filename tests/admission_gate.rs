use std::sync::Arc;

use async_trait::async_trait;
use tollgate::{
    AdmissionGate, AdmissionOutcome, AdmissionRequest, AdmissionState, ConsumeLimits,
    ConsumeOutcome, CounterKey, CounterStore, LimitDimension, MemoryStore, PeriodGranularity,
    QuotaPolicy, RejectionReason, StoreError, TokenDelta, UsageCounter, UsageLedger,
};

fn gate() -> AdmissionGate {
    AdmissionGate::new(UsageLedger::new(Arc::new(MemoryStore::new())))
}

fn request(identity: &str) -> AdmissionRequest {
    AdmissionRequest {
        project_id: "proj".to_string(),
        identity: identity.to_string(),
        model: "gpt-4o".to_string(),
        estimated_cost_usd_micros: 20_000,
    }
}

fn daily(max_requests: u64) -> QuotaPolicy {
    QuotaPolicy {
        max_requests: Some(max_requests),
        granularity: PeriodGranularity::Daily,
        ..QuotaPolicy::default()
    }
}

/// A backend that can only report itself unreachable.
struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn ensure_row(&self, _key: &CounterKey) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn try_consume(
        &self,
        _key: &CounterKey,
        _amount: u64,
        _limits: ConsumeLimits,
    ) -> Result<ConsumeOutcome, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn record_blocked(
        &self,
        _key: &CounterKey,
        _estimated_cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn adjust_usage(
        &self,
        _key: &CounterKey,
        _tokens: TokenDelta,
        _cost_usd_micros: u64,
    ) -> Result<(), StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn get_usage(&self, _key: &CounterKey) -> Result<Option<UsageCounter>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn list_usage(
        &self,
        _project_id: &str,
    ) -> Result<Vec<(CounterKey, UsageCounter)>, StoreError> {
        Err(StoreError::unavailable("connection refused"))
    }
}

#[tokio::test]
async fn reserve_forward_settle_charges_the_admitted_counter() {
    let gate = gate();
    let policy = daily(5);

    let outcome = gate.admit(&request("user"), &policy).await.expect("admit");
    let AdmissionOutcome::Admitted(mut admission) = outcome else {
        panic!("expected admission");
    };
    assert_eq!(admission.state(), AdmissionState::Reserved);
    assert_eq!(admission.requests_used(), 1);

    admission.mark_forwarded();
    assert_eq!(admission.state(), AdmissionState::Forwarded);

    admission
        .settle(TokenDelta::new(120, 30), 7_500)
        .await
        .expect("settle");

    let counter = gate
        .ledger()
        .snapshot("proj", "user", "gpt-4o", &policy)
        .await
        .expect("snapshot")
        .expect("row");
    assert_eq!(counter.requests_used, 1);
    assert_eq!(counter.tokens_used, 150);
    assert_eq!(counter.input_tokens, 120);
    assert_eq!(counter.output_tokens, 30);
    assert_eq!(counter.cost_usd_micros, 7_500);

    let metrics = gate.metrics();
    assert_eq!(metrics.admitted, 1);
    assert_eq!(metrics.settled, 1);
    assert_eq!(metrics.rejected, 0);
}

#[tokio::test]
async fn rejection_carries_dimension_and_snapshot_and_books_savings() {
    let gate = gate();
    let policy = daily(1);

    let first = gate.admit(&request("user"), &policy).await.expect("admit");
    assert!(matches!(first, AdmissionOutcome::Admitted(_)));

    let second = gate.admit(&request("user"), &policy).await.expect("admit");
    let AdmissionOutcome::Rejected(rejection) = second else {
        panic!("expected rejection");
    };
    assert!(matches!(
        rejection.reason,
        RejectionReason::LimitExceeded {
            dimension: LimitDimension::Requests
        }
    ));
    let snapshot = rejection.snapshot.expect("snapshot on denial");
    assert_eq!(snapshot.requests_used, 1);

    let counter = gate
        .ledger()
        .snapshot("proj", "user", "gpt-4o", &policy)
        .await
        .expect("snapshot")
        .expect("row");
    assert_eq!(counter.requests_used, 1);
    assert_eq!(counter.blocked_requests, 1);
    assert_eq!(counter.saved_usd_micros, 20_000);

    let metrics = gate.metrics();
    assert_eq!(metrics.admitted, 1);
    assert_eq!(metrics.rejected, 1);
}

#[tokio::test]
async fn upstream_failure_keeps_the_slot() {
    let gate = gate();
    let policy = daily(1);

    let outcome = gate.admit(&request("user"), &policy).await.expect("admit");
    let AdmissionOutcome::Admitted(admission) = outcome else {
        panic!("expected admission");
    };
    admission.fail();

    // The reserved unit stays consumed, so the retry is rejected.
    let retry = gate.admit(&request("user"), &policy).await.expect("admit");
    assert!(matches!(retry, AdmissionOutcome::Rejected(_)));

    let counter = gate
        .ledger()
        .snapshot("proj", "user", "gpt-4o", &policy)
        .await
        .expect("snapshot")
        .expect("row");
    assert_eq!(counter.requests_used, 1);
    assert_eq!(counter.tokens_used, 0);
    assert_eq!(counter.cost_usd_micros, 0);

    let metrics = gate.metrics();
    assert_eq!(metrics.upstream_failed, 1);
    assert_eq!(metrics.settled, 0);
}

#[tokio::test]
async fn unreachable_backend_fails_closed() {
    let gate = AdmissionGate::new(UsageLedger::new(Arc::new(FailingStore)));
    let policy = daily(100);

    let outcome = gate.admit(&request("user"), &policy).await.expect("admit");
    let AdmissionOutcome::Rejected(rejection) = outcome else {
        panic!("expected rejection");
    };
    assert!(matches!(
        rejection.reason,
        RejectionReason::BackendUnavailable { .. }
    ));
    assert!(rejection.snapshot.is_none());

    let metrics = gate.metrics();
    assert_eq!(metrics.failed_closed, 1);
    assert_eq!(metrics.admitted, 0);
    assert_eq!(metrics.rejected, 0);
}

#[tokio::test]
async fn token_cap_rejection_names_the_token_dimension() {
    let gate = gate();
    let policy = QuotaPolicy {
        max_requests: Some(100),
        max_tokens: Some(50),
        granularity: PeriodGranularity::Daily,
        ..QuotaPolicy::default()
    };

    let outcome = gate.admit(&request("user"), &policy).await.expect("admit");
    let AdmissionOutcome::Admitted(admission) = outcome else {
        panic!("expected admission");
    };
    admission
        .settle(TokenDelta::new(40, 20), 3_000)
        .await
        .expect("settle");

    let outcome = gate.admit(&request("user"), &policy).await.expect("admit");
    let AdmissionOutcome::Rejected(rejection) = outcome else {
        panic!("expected rejection");
    };
    assert!(matches!(
        rejection.reason,
        RejectionReason::LimitExceeded {
            dimension: LimitDimension::Tokens
        }
    ));
}

#[tokio::test]
async fn contended_gate_admits_exactly_the_limit() {
    let gate = Arc::new(gate());
    let policy = daily(5);

    let mut handles = Vec::new();
    for _ in 0..20 {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            gate.admit(&request("user"), &policy).await
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        match handle.await.expect("join").expect("admit") {
            AdmissionOutcome::Admitted(admission) => {
                admitted += 1;
                admission.settle(TokenDelta::new(10, 5), 1_000).await.expect("settle");
            }
            AdmissionOutcome::Rejected(_) => {}
        }
    }
    assert_eq!(admitted, 5);

    let metrics = gate.metrics();
    assert_eq!(metrics.admitted, 5);
    assert_eq!(metrics.rejected, 15);
    assert_eq!(metrics.settled, 5);

    let counter = gate
        .ledger()
        .snapshot("proj", "user", "gpt-4o", &policy)
        .await
        .expect("snapshot")
        .expect("row");
    assert_eq!(counter.requests_used, 5);
    assert_eq!(counter.tokens_used, 75);
    assert_eq!(counter.blocked_requests, 15);
}

#[tokio::test]
async fn malformed_request_is_an_error_not_a_rejection() {
    let gate = gate();
    let policy = daily(5);
    let bad = AdmissionRequest {
        project_id: String::new(),
        identity: "user".to_string(),
        model: "gpt-4o".to_string(),
        estimated_cost_usd_micros: 0,
    };
    assert!(gate.admit(&bad, &policy).await.is_err());
    assert_eq!(gate.metrics().failed_closed, 0);
}

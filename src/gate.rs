use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::counter::{TokenDelta, UsageCounter};
use crate::error::TollgateError;
use crate::key::CounterKey;
use crate::ledger::UsageLedger;
use crate::metrics::{AdmissionMetrics, AdmissionMetricsSnapshot};
use crate::policy::QuotaPolicy;
use crate::store::LimitDimension;

/// What the proxy request handler hands over before forwarding upstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub project_id: String,
    pub identity: String,
    pub model: String,
    /// Estimate of what the call would have cost, booked as savings when it
    /// is rejected.
    pub estimated_cost_usd_micros: u64,
}

/// Per-request lifecycle. The request unit is consumed at admission time,
/// not at success time, so `Failed` still counts against the limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionState {
    Reserved,
    Forwarded,
    Settled,
    Failed,
}

/// Structured rejection surfaced to the SDK/client layer. Distinguishable
/// from a generic error: carries the exceeded dimension and the usage
/// snapshot at denial time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectionReason,
    pub snapshot: Option<UsageCounter>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectionReason {
    LimitExceeded { dimension: LimitDimension },
    /// The store could not answer; the gate failed closed rather than allow
    /// unmetered consumption.
    BackendUnavailable { message: String },
}

pub enum AdmissionOutcome {
    Admitted(Admission),
    Rejected(Rejection),
}

/// A reserved request slot. Terminal states: [`Admission::settle`] after the
/// upstream call produced billable output, or [`Admission::fail`] when it
/// errored.
///
/// `fail` does not refund the reserved unit. Refunding would reopen the race
/// the engine exists to prevent: a burst of failing-then-retried calls could
/// otherwise starve the limit check. Deliberate policy, preserved as-is.
pub struct Admission {
    ledger: Arc<UsageLedger>,
    metrics: Arc<AdmissionMetrics>,
    key: CounterKey,
    requests_used: u64,
    state: AdmissionState,
}

impl Admission {
    /// The counter key the reservation was booked against.
    pub fn key(&self) -> &CounterKey {
        &self.key
    }

    /// Stored request count right after the reservation.
    pub fn requests_used(&self) -> u64 {
        self.requests_used
    }

    pub fn state(&self) -> AdmissionState {
        self.state
    }

    /// The upstream call is in flight.
    pub fn mark_forwarded(&mut self) {
        self.state = AdmissionState::Forwarded;
    }

    /// Charges actual tokens and cost against the admission-time key, so a
    /// call that straddles a period boundary settles into the period it was
    /// admitted in.
    pub async fn settle(
        mut self,
        tokens: TokenDelta,
        cost_usd_micros: u64,
    ) -> Result<(), TollgateError> {
        self.state = AdmissionState::Settled;
        self.metrics.record_settled();
        self.ledger
            .charge_key(&self.key, tokens, cost_usd_micros)
            .await
    }

    /// The upstream call errored after the slot was consumed. No refund; no
    /// charge either, since nothing billable was produced.
    pub fn fail(mut self) {
        self.state = AdmissionState::Failed;
        self.metrics.record_upstream_failed();
        tracing::debug!(counter = %self.key, "upstream call failed after admission; slot kept");
    }
}

/// Thin façade used by the proxy request path: reserve, forward, then settle
/// or fail.
pub struct AdmissionGate {
    ledger: Arc<UsageLedger>,
    metrics: Arc<AdmissionMetrics>,
}

impl AdmissionGate {
    pub fn new(ledger: UsageLedger) -> Self {
        Self::with_ledger(Arc::new(ledger))
    }

    pub fn with_ledger(ledger: Arc<UsageLedger>) -> Self {
        Self {
            ledger,
            metrics: Arc::new(AdmissionMetrics::default()),
        }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn metrics(&self) -> AdmissionMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Pre-flight reservation of one request unit.
    ///
    /// Quota exhaustion and backend unavailability both come back as
    /// `Rejected` (the latter fails closed); `Err` is reserved for malformed
    /// input.
    pub async fn admit(
        &self,
        request: &AdmissionRequest,
        policy: &QuotaPolicy,
    ) -> Result<AdmissionOutcome, TollgateError> {
        let consumed = self
            .ledger
            .consume(
                &request.project_id,
                &request.identity,
                &request.model,
                1,
                policy,
            )
            .await;

        match consumed {
            Ok(decision) if decision.allowed => {
                self.metrics.record_admitted();
                Ok(AdmissionOutcome::Admitted(Admission {
                    ledger: Arc::clone(&self.ledger),
                    metrics: Arc::clone(&self.metrics),
                    key: decision.key,
                    requests_used: decision.requests_used,
                    state: AdmissionState::Reserved,
                }))
            }
            Ok(decision) => {
                self.metrics.record_rejected();
                if let Err(err) = self
                    .ledger
                    .record_rejection(
                        &request.project_id,
                        &request.identity,
                        &request.model,
                        request.estimated_cost_usd_micros,
                        policy,
                    )
                    .await
                {
                    tracing::warn!(error = %err, "failed to book rejected request");
                }
                Ok(AdmissionOutcome::Rejected(Rejection {
                    reason: RejectionReason::LimitExceeded {
                        dimension: decision.exceeded.unwrap_or(LimitDimension::Requests),
                    },
                    snapshot: decision.snapshot,
                }))
            }
            Err(TollgateError::Store(err)) => {
                self.metrics.record_failed_closed();
                tracing::warn!(error = %err, "store error during admission; failing closed");
                Ok(AdmissionOutcome::Rejected(Rejection {
                    reason: RejectionReason::BackendUnavailable {
                        message: err.to_string(),
                    },
                    snapshot: None,
                }))
            }
            Err(err) => Err(err),
        }
    }
}

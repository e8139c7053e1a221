use std::sync::Arc;

use time::OffsetDateTime;

use crate::counter::{TokenDelta, UsageCounter};
use crate::error::TollgateError;
use crate::key::CounterKey;
use crate::period::QuotaPeriod;
use crate::policy::QuotaPolicy;
use crate::store::{ConsumeOutcome, CounterStore, LimitDimension, StoreError};

pub trait Clock: Send + Sync {
    fn now_epoch_seconds(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_secs()
    }
}

/// Outcome of one admission-controlled consumption attempt.
#[derive(Clone, Debug)]
pub struct Decision {
    pub allowed: bool,
    /// Stored request count after the attempt.
    pub requests_used: u64,
    pub exceeded: Option<LimitDimension>,
    /// The counter key the attempt resolved to; post-hoc charges for this
    /// call should target the same key even if a period boundary has passed
    /// by the time the upstream call completes.
    pub key: CounterKey,
    /// Populated on denial for the SDK's structured rejection payload.
    pub snapshot: Option<UsageCounter>,
}

/// The core engine: resolves counter keys via the period calculator and
/// drives the backend's atomic-consumption contract.
///
/// The ledger owns an explicit backend instance scoped to the service
/// process; there is no ambient global counter state.
pub struct UsageLedger {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.clock.now_epoch_seconds() as i64)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH)
    }

    /// Resolves the counter key for the active period of `policy`.
    pub fn current_key(
        &self,
        project_id: &str,
        identity: &str,
        model: &str,
        policy: &QuotaPolicy,
    ) -> CounterKey {
        let period = QuotaPeriod::current(self.now_utc(), policy.granularity);
        CounterKey::new(project_id, identity, model, period.start)
    }

    /// Pre-flight reservation of `amount` request units.
    ///
    /// A `false` outcome is authoritative: it is surfaced as a denial and
    /// never retried, since retrying would circumvent the limit. The only
    /// local retry is a single bounded `ensure_row` -> `try_consume` pass
    /// when a concurrent first writer raced row creation.
    pub async fn consume(
        &self,
        project_id: &str,
        identity: &str,
        model: &str,
        amount: u64,
        policy: &QuotaPolicy,
    ) -> Result<Decision, TollgateError> {
        validate_scope(project_id, identity, model)?;
        if amount == 0 {
            return Err(TollgateError::InvalidRequest {
                reason: "consume amount must be at least 1".to_string(),
            });
        }

        let key = self.current_key(project_id, identity, model, policy);
        let limits = policy.limits();

        self.store.ensure_row(&key).await?;
        let outcome = match self.store.try_consume(&key, amount, limits).await {
            Ok(outcome) => outcome,
            // Duplicate-key races surface here as a missing row; absorb once.
            Err(StoreError::RowMissing) => {
                self.store.ensure_row(&key).await?;
                self.store.try_consume(&key, amount, limits).await?
            }
            Err(err) => return Err(err.into()),
        };

        self.decision(key, outcome).await
    }

    async fn decision(
        &self,
        key: CounterKey,
        outcome: ConsumeOutcome,
    ) -> Result<Decision, TollgateError> {
        let snapshot = if outcome.allowed {
            None
        } else {
            tracing::debug!(
                counter = %key,
                requests_used = outcome.requests_used,
                exceeded = outcome.exceeded.map(|d| d.to_string()),
                "quota denied"
            );
            self.store.get_usage(&key).await.ok().flatten()
        };
        Ok(Decision {
            allowed: outcome.allowed,
            requests_used: outcome.requests_used,
            exceeded: outcome.exceeded,
            key,
            snapshot,
        })
    }

    /// Post-hoc charge once the upstream call has completed. Never denies
    /// and never retroactively un-allows an admitted request.
    pub async fn charge(
        &self,
        project_id: &str,
        identity: &str,
        model: &str,
        tokens: TokenDelta,
        cost_usd_micros: u64,
        policy: &QuotaPolicy,
    ) -> Result<(), TollgateError> {
        validate_scope(project_id, identity, model)?;
        let key = self.current_key(project_id, identity, model, policy);
        self.charge_key(&key, tokens, cost_usd_micros).await
    }

    /// Charge against an already-resolved key, e.g. the one captured at
    /// admission time.
    pub async fn charge_key(
        &self,
        key: &CounterKey,
        tokens: TokenDelta,
        cost_usd_micros: u64,
    ) -> Result<(), TollgateError> {
        self.store.adjust_usage(key, tokens, cost_usd_micros).await?;
        Ok(())
    }

    /// Books a rejected call: bumps `blocked_requests` and the saved-cost
    /// estimate. Best-effort; never gates.
    pub async fn record_rejection(
        &self,
        project_id: &str,
        identity: &str,
        model: &str,
        estimated_cost_usd_micros: u64,
        policy: &QuotaPolicy,
    ) -> Result<(), TollgateError> {
        validate_scope(project_id, identity, model)?;
        let key = self.current_key(project_id, identity, model, policy);
        self.store
            .record_blocked(&key, estimated_cost_usd_micros)
            .await?;
        Ok(())
    }

    /// Read path for dashboards and billing; display-grade freshness.
    pub async fn snapshot(
        &self,
        project_id: &str,
        identity: &str,
        model: &str,
        policy: &QuotaPolicy,
    ) -> Result<Option<UsageCounter>, TollgateError> {
        validate_scope(project_id, identity, model)?;
        let key = self.current_key(project_id, identity, model, policy);
        Ok(self.store.get_usage(&key).await?)
    }

    /// All counters for a project across identities, models and periods.
    pub async fn project_usage(
        &self,
        project_id: &str,
    ) -> Result<Vec<(CounterKey, UsageCounter)>, TollgateError> {
        if project_id.is_empty() {
            return Err(TollgateError::InvalidRequest {
                reason: "project_id must not be empty".to_string(),
            });
        }
        Ok(self.store.list_usage(project_id).await?)
    }
}

fn validate_scope(project_id: &str, identity: &str, model: &str) -> Result<(), TollgateError> {
    for (name, value) in [
        ("project_id", project_id),
        ("identity", identity),
        ("model", model),
    ] {
        if value.is_empty() {
            return Err(TollgateError::InvalidRequest {
                reason: format!("{name} must not be empty"),
            });
        }
    }
    Ok(())
}

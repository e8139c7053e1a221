//! Storage backend contract shared by all counter stores.

pub mod memory;
#[cfg(feature = "store-redis")]
pub mod redis;
#[cfg(feature = "store-sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::counter::{TokenDelta, UsageCounter};
use crate::key::CounterKey;

/// Per-period caps handed to [`CounterStore::try_consume`], resolved from the
/// active [`crate::QuotaPolicy`]. `None` means unlimited.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsumeLimits {
    pub max_requests: Option<u64>,
    pub max_tokens: Option<u64>,
    pub max_cost_usd_micros: Option<u64>,
}

/// Which cap turned a call away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitDimension {
    Requests,
    Tokens,
    Cost,
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requests => f.write_str("requests"),
            Self::Tokens => f.write_str("tokens"),
            Self::Cost => f.write_str("cost"),
        }
    }
}

/// Result of one atomic check-and-increment.
#[derive(Clone, Copy, Debug)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Stored request count after the operation: incremented when allowed,
    /// untouched when denied.
    pub requests_used: u64,
    pub exceeded: Option<LimitDimension>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The counter row was absent where one was required. Absorbed by the
    /// ledger with a single bounded `ensure_row` retry.
    #[error("counter row missing")]
    RowMissing,
    /// The backend could not be reached or failed mid-operation.
    #[error("storage backend unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

#[cfg(feature = "store-sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::unavailable(err.to_string())
    }
}

#[cfg(feature = "store-sqlite")]
impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::unavailable(err.to_string())
    }
}

#[cfg(feature = "store-redis")]
impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        Self::unavailable(err.to_string())
    }
}

/// Atomic-consumption contract implemented by every backend.
///
/// `try_consume` is the only operation that needs strong atomicity: a single
/// indivisible step per key, enforced at the persistence layer (mutex, row
/// filter, or server-side script), never by optimistic retry in the caller.
/// The remaining operations are commutative accumulations and are safe to
/// apply concurrently with each other and with `try_consume`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Idempotent insert-if-absent. Concurrent calls for the same key must
    /// produce exactly one row; a duplicate-key conflict from a concurrent
    /// first writer is not an error.
    async fn ensure_row(&self, key: &CounterKey) -> Result<(), StoreError>;

    /// Atomically: read the current counters, and if `requests_used + amount`
    /// fits under the request cap and the token/cost caps have not already
    /// been crossed, persist the incremented request count. Otherwise leave
    /// the row unchanged and report the exceeded dimension.
    async fn try_consume(
        &self,
        key: &CounterKey,
        amount: u64,
        limits: ConsumeLimits,
    ) -> Result<ConsumeOutcome, StoreError>;

    /// Bumps `blocked_requests` and `saved_usd_micros`. Best-effort
    /// bookkeeping, not gating.
    async fn record_blocked(
        &self,
        key: &CounterKey,
        estimated_cost_usd_micros: u64,
    ) -> Result<(), StoreError>;

    /// Post-hoc, ungated accumulation of tokens and cost.
    async fn adjust_usage(
        &self,
        key: &CounterKey,
        tokens: TokenDelta,
        cost_usd_micros: u64,
    ) -> Result<(), StoreError>;

    /// Display-grade snapshot; reflects some consistent prior state.
    async fn get_usage(&self, key: &CounterKey) -> Result<Option<UsageCounter>, StoreError>;

    /// All counter rows for a project, for dashboards and billing exports.
    async fn list_usage(
        &self,
        project_id: &str,
    ) -> Result<Vec<(CounterKey, UsageCounter)>, StoreError>;
}

/// Shared denial classification. Checked in a fixed order so every backend
/// reports the same dimension for the same state: requests, then tokens,
/// then cost.
pub(crate) fn exceeded_dimension(
    requests_used: u64,
    tokens_used: u64,
    cost_usd_micros: u64,
    amount: u64,
    limits: &ConsumeLimits,
) -> Option<LimitDimension> {
    if let Some(max) = limits.max_requests {
        if requests_used.saturating_add(amount) > max {
            return Some(LimitDimension::Requests);
        }
    }
    if let Some(max) = limits.max_tokens {
        if tokens_used >= max {
            return Some(LimitDimension::Tokens);
        }
    }
    if let Some(max) = limits.max_cost_usd_micros {
        if cost_usd_micros >= max {
            return Some(LimitDimension::Cost);
        }
    }
    None
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(any(feature = "store-sqlite", feature = "store-redis"))]
pub(crate) fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

#[cfg(feature = "store-sqlite")]
pub(crate) fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

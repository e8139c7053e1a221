//! Atomic usage-counter and admission-control engine for multi-tenant LLM
//! proxies.
//!
//! A single upstream API key is shared across many downstream identities.
//! Every proxied call passes through the [`AdmissionGate`], which reserves a
//! request slot against a per-`(project, identity, model, period)` counter
//! before the call is forwarded, and charges token/cost usage after it
//! completes. The check-and-increment is a single indivisible operation at
//! the storage layer, so concurrent callers can never collectively exceed a
//! configured limit.
//!
//! Storage backends implement the [`CounterStore`] contract:
//!
//! - [`MemoryStore`] — in-process, for local and single-instance deployments.
//! - `SqliteStore` (feature `store-sqlite`) — single-node persistent.
//! - `RedisStore` (feature `store-redis`) — multi-process, multi-host.

pub mod counter;
pub mod error;
pub mod gate;
pub mod key;
pub mod ledger;
pub mod metrics;
pub mod period;
pub mod policy;
pub mod store;

pub use counter::{TokenDelta, UsageCounter};
pub use error::TollgateError;
pub use gate::{
    Admission, AdmissionGate, AdmissionOutcome, AdmissionRequest, AdmissionState, Rejection,
    RejectionReason,
};
pub use key::CounterKey;
pub use ledger::{Clock, Decision, SystemClock, UsageLedger};
pub use metrics::{AdmissionMetrics, AdmissionMetricsSnapshot};
pub use period::{PeriodGranularity, QuotaPeriod};
pub use policy::QuotaPolicy;
pub use store::{ConsumeLimits, ConsumeOutcome, CounterStore, LimitDimension, StoreError};
pub use store::memory::MemoryStore;

#[cfg(feature = "store-redis")]
pub use store::redis::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use store::sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

use crate::period::PeriodGranularity;
use crate::store::ConsumeLimits;

/// Numeric limits for one project/tier, resolved by the external plan lookup.
///
/// The engine treats a policy as a read-only input per call and never caches
/// it across periods. `None` means the dimension is unlimited; a limit of
/// zero is a valid "disabled" policy, not an error.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QuotaPolicy {
    pub max_requests: Option<u64>,
    pub max_tokens: Option<u64>,
    pub max_cost_usd_micros: Option<u64>,
    #[serde(default)]
    pub granularity: PeriodGranularity,
}

impl QuotaPolicy {
    /// An unlimited policy; useful for tests and passthrough tiers.
    pub fn unlimited(granularity: PeriodGranularity) -> Self {
        Self {
            granularity,
            ..Self::default()
        }
    }

    pub(crate) fn limits(&self) -> ConsumeLimits {
        ConsumeLimits {
            max_requests: self.max_requests,
            max_tokens: self.max_tokens,
            max_cost_usd_micros: self.max_cost_usd_micros,
        }
    }
}

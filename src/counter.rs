use serde::{Deserialize, Serialize};

/// Token deltas reported by the upstream call once it has completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDelta {
    pub input: u64,
    pub output: u64,
}

impl TokenDelta {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

/// Snapshot of one counter row.
///
/// All monetary fields are fixed-point micro-USD; floating point is never
/// used for accumulation. After every successful adjustment
/// `tokens_used == input_tokens + output_tokens`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounter {
    /// Admitted calls. Never exceeds the request limit in force at
    /// increment time.
    pub requests_used: u64,
    pub tokens_used: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd_micros: u64,
    /// Calls rejected for this key.
    pub blocked_requests: u64,
    /// Estimated cost avoided by blocking, micro-USD.
    pub saved_usd_micros: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl UsageCounter {
    pub(crate) fn new(now_ms: u64) -> Self {
        Self {
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            ..Self::default()
        }
    }
}

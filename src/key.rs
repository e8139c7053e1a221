use serde::{Deserialize, Serialize};
use time::Date;

use crate::period::format_period_start;

/// Identifies one quota bucket: a counter row in any backend.
///
/// The tuple `(project_id, identity, model, period_start)` is the natural
/// unique key. A new period start produces a new key, and therefore a new
/// counter row; rows for closed periods are never mutated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// Top-level owner of the upstream credential and its quota policy.
    pub project_id: String,
    /// Caller-supplied sub-tenant, e.g. an end-user id.
    pub identity: String,
    /// Upstream model name, e.g. "gpt-4o".
    pub model: String,
    /// Inclusive start of the active quota window (UTC).
    pub period_start: Date,
}

impl CounterKey {
    pub fn new(
        project_id: impl Into<String>,
        identity: impl Into<String>,
        model: impl Into<String>,
        period_start: Date,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            identity: identity.into(),
            model: model.into(),
            period_start,
        }
    }

    /// Period start formatted as `YYYY-MM-DD`, the on-disk/wire form.
    pub fn period_start_str(&self) -> String {
        format_period_start(self.period_start)
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.project_id,
            self.identity,
            self.model,
            self.period_start_str()
        )
    }
}

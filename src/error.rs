use thiserror::Error;

use crate::store::StoreError;

/// Top-level error for ledger and gate operations.
///
/// Quota exhaustion is deliberately not represented here: a denied call is a
/// normal, high-frequency outcome and is returned as a value
/// ([`crate::Decision`] / [`crate::Rejection`]), never as an error.
#[derive(Debug, Error)]
pub enum TollgateError {
    /// Programmer error: malformed key parts or a zero consume amount.
    /// Rejected immediately, never silently clamped.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The storage backend could not be reached or failed mid-operation.
    /// Fatal to the admission decision for that call; the gate fails closed.
    #[error("storage backend error: {0}")]
    Store(#[from] StoreError),
}

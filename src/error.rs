//! Error taxonomy for the admission and ledger paths.
//!
//! Expected outcomes (quota exhausted, cooldown active) are *decisions*, not
//! errors — see [`Admission`](crate::admission::Admission). The types here
//! cover infrastructure faults and startup misconfiguration only.

use thiserror::Error;

/// Counter-store faults. Timeouts are folded into `Unavailable`: the admission
/// path treats a slow store the same as a dead one and fails closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

/// Faults surfaced by [`AdmissionController`](crate::admission::AdmissionController).
///
/// Maps to a 503-class response at the edge; quota and cooldown denials are
/// carried in the `Admission` decision instead and map to 429.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// The counter store could not answer in time. Write-type operations must
    /// be denied rather than admitted unmetered.
    #[error("admission failed closed: {0}")]
    StoreUnavailable(#[from] StoreError),
}

/// Faults from the durable usage ledger. Retried by the background sync and
/// never surfaced to the request that produced the usage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("ledger write failed: {0}")]
    WriteFailed(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Faults from the payment-provider collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("billing provider rejected charge: {0}")]
    Rejected(String),
    #[error("billing provider unavailable: {0}")]
    Unavailable(String),
}

/// Startup-time policy table problems. Never produced at request time; an
/// unknown plan falls back to the most restrictive tier instead.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid policy table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("policy table must define the {0:?} tier")]
    MissingDefaultTier(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_into_admission_error() {
        let err: AdmissionError = StoreError::Unavailable("connection refused".into()).into();
        let msg = err.to_string();
        assert!(msg.contains("failed closed"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn policy_parse_error_wraps_serde() {
        let parse = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err = PolicyError::from(parse);
        assert!(err.to_string().contains("invalid policy table"));
    }
}

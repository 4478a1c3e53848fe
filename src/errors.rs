// Leaf error types the state machine pattern-matches on to classify a
// step failure per the engine's failure taxonomy (transient / signature /
// structural / policy).  Everything else propagates as a plain
// `anyhow::Error` with context, the same as the rest of the engine.

use thiserror::Error;

/// A condition that requires re-pulling a keyring and retrying once before
/// becoming fatal.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature verification failed for {artifact}")]
    Invalid { artifact: String },
    #[error("keyring {keyring} expired at {expiry}")]
    KeyringExpired { keyring: String, expiry: String },
    #[error("keyring {keyring} is not signed by its parent keyring")]
    UntrustedKeyring { keyring: String },
}

/// A malformed or internally inconsistent input.  Never retried.
#[derive(Debug, Error)]
pub enum StructuralError {
    #[error("index contains a delta image with no reachable base (version {version})")]
    UnreachableBase { version: u64 },
    #[error("two files declare destination {dest} with different url/checksum")]
    DuplicateDestination { dest: String },
    #[error("recovery command file references a file with no signature: {path}")]
    MissingSignature { path: String },
    #[error("malformed index: {reason}")]
    MalformedIndex { reason: String },
}

/// A non-error terminal outcome: there is nothing further to do this run.
#[derive(Debug, Error)]
pub enum PolicyOutcome {
    #[error("device is already at the latest eligible version")]
    NoUpdate,
    #[error("no eligible candidate path: {reason}")]
    NoPath { reason: String },
    #[error("candidate gated by phased rollout (device percentage {device_pct})")]
    PhaseGated { device_pct: u8 },
}

/// Transient conditions (network, interrupted I/O) that the caller should
/// retry within the step's configured timeout/backoff budget.
#[derive(Debug, Error)]
pub enum TransientError {
    #[error("network request failed: {0}")]
    Network(String),
    #[error("I/O interrupted: {0}")]
    Io(String),
}

/// The reason surfaced on `UpdateFailed` and `UpdateAvailableStatus`.
/// Kept as a plain string in the public event types (matching how the
/// spec's event fields are described), constructed from the typed errors
/// above at the point a step fails.
pub fn reason_string(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<SignatureError>() {
        return format!("signature: {e}");
    }
    if let Some(e) = err.downcast_ref::<StructuralError>() {
        return format!("structural: {e}");
    }
    if let Some(e) = err.downcast_ref::<PolicyOutcome>() {
        return format!("policy: {e}");
    }
    if let Some(e) = err.downcast_ref::<TransientError>() {
        return format!("transient: {e}");
    }
    err.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_string_classifies() {
        let err: anyhow::Error = SignatureError::Invalid {
            artifact: "foo.zip".into(),
        }
        .into();
        assert!(reason_string(&err).starts_with("signature:"));

        let err: anyhow::Error = PolicyOutcome::NoUpdate.into();
        assert!(reason_string(&err).starts_with("policy:"));

        let err: anyhow::Error = anyhow::anyhow!("boom");
        assert_eq!(reason_string(&err), "boom");
    }
}

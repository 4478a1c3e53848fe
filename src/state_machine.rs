// State machine (spec §4.8): drives a run through config/keyrings/
// channels/index/path/download/stage/apply, classifying every step
// failure via the leaf error types in `errors.rs` the way the rest of
// the engine reports failures -- `anyhow::Error` with `Context`, matched
// against a small set of known variants at the point a decision is
// needed, never by parsing strings.

use crate::errors::{PolicyOutcome, SignatureError, StructuralError, TransientError};
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    ConfigLoaded,
    KeyringsReady,
    ChannelsFetched,
    IndexFetched,
    PathComputed,
    NoUpdate,
    ReadyToDownload,
    Downloading,
    DownloadPaused,
    Downloaded,
    Staged,
    Applied,
    Failed,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::NoUpdate | State::Applied | State::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Signature,
    Structural,
    Policy,
}

pub fn classify(err: &anyhow::Error) -> FailureClass {
    if err.downcast_ref::<TransientError>().is_some() {
        return FailureClass::Transient;
    }
    if err.downcast_ref::<SignatureError>().is_some() {
        return FailureClass::Signature;
    }
    if err.downcast_ref::<StructuralError>().is_some() {
        return FailureClass::Structural;
    }
    if err.downcast_ref::<PolicyOutcome>().is_some() {
        return FailureClass::Policy;
    }
    // Unrecognized errors (I/O errors not wrapped in a typed variant,
    // parse failures, etc.) are treated as structural: they are not
    // known to be safe to retry, so the conservative choice is fatal
    // rather than silently looping.
    FailureClass::Structural
}

/// One step's outcome, folded into the machine's next transition by the
/// caller driving a run (the façade's `check`/`download`/`apply` methods
/// in `service.rs`).
pub enum StepOutcome {
    Advance(State),
    Retry { delay: std::time::Duration },
    RepullKeyringThenRetry,
    Terminal(State),
    Fatal(anyhow::Error),
}

/// Applies the failure-classification rule from spec §4.8/§7 to decide
/// what a step should do next, given how many times it has already been
/// retried for this reason.
pub fn decide(state: State, err: anyhow::Error, retried_transient: bool, repulled_keyring: bool) -> StepOutcome {
    match classify(&err) {
        FailureClass::Transient if !retried_transient => StepOutcome::Retry {
            delay: std::time::Duration::from_secs(1),
        },
        FailureClass::Signature if !repulled_keyring => StepOutcome::RepullKeyringThenRetry,
        FailureClass::Policy => {
            if let Some(PolicyOutcome::NoUpdate) | Some(PolicyOutcome::PhaseGated { .. }) =
                err.downcast_ref::<PolicyOutcome>()
            {
                StepOutcome::Terminal(State::NoUpdate)
            } else {
                StepOutcome::Fatal(err)
            }
        }
        _ => {
            let _ = state;
            StepOutcome::Fatal(err)
        }
    }
}

/// Transitions valid from each state, used to reject an out-of-order
/// `apply`/`cancel` request at the façade boundary (spec: "Apply is
/// valid only from Downloaded or Staged").
pub fn can_apply(state: State) -> bool {
    matches!(state, State::Downloaded | State::Staged)
}

/// `Cancel` forces `Failed` unless no download is in flight, in which
/// case it's a no-op (spec §4.8).
pub fn cancel(state: State) -> Result<State> {
    match state {
        State::Downloading | State::DownloadPaused => Ok(State::Failed),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_retried_once() {
        let err = TransientError::Network("timeout".into()).into();
        let outcome = decide(State::Downloading, err, false, false);
        assert!(matches!(outcome, StepOutcome::Retry { .. }));
    }

    #[test]
    fn test_transient_fatal_after_retry() {
        let err = TransientError::Network("timeout".into()).into();
        let outcome = decide(State::Downloading, err, true, false);
        assert!(matches!(outcome, StepOutcome::Fatal(_)));
    }

    #[test]
    fn test_signature_triggers_keyring_repull_once() {
        let err = SignatureError::Invalid { artifact: "a.zip".into() }.into();
        let outcome = decide(State::Downloading, err, false, false);
        assert!(matches!(outcome, StepOutcome::RepullKeyringThenRetry));
    }

    #[test]
    fn test_signature_fatal_after_repull() {
        let err = SignatureError::Invalid { artifact: "a.zip".into() }.into();
        let outcome = decide(State::Downloading, err, false, true);
        assert!(matches!(outcome, StepOutcome::Fatal(_)));
    }

    #[test]
    fn test_no_update_is_terminal_not_fatal() {
        let err = PolicyOutcome::NoUpdate.into();
        let outcome = decide(State::PathComputed, err, false, false);
        assert!(matches!(outcome, StepOutcome::Terminal(State::NoUpdate)));
    }

    #[test]
    fn test_cancel_during_download_fails() {
        assert_eq!(cancel(State::Downloading).unwrap(), State::Failed);
    }

    #[test]
    fn test_cancel_without_download_is_noop() {
        assert_eq!(cancel(State::IndexFetched).unwrap(), State::IndexFetched);
    }

    #[test]
    fn test_apply_only_from_downloaded_or_staged() {
        assert!(can_apply(State::Downloaded));
        assert!(can_apply(State::Staged));
        assert!(!can_apply(State::Downloading));
    }
}

use std::{fmt, net::SocketAddr};

use rand::Rng;
use tracing::{debug, trace};

/// Retries after the first PATH_CHALLENGE before validation fails
pub(super) const MAX_RETRY_TIMES: u32 = 2;

/// How a path validation ended
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PathValidationOutcome {
    /// The peer echoed a challenge on the path
    Validated,
    /// All challenges went unanswered
    TimedOut,
    /// Another validation superseded this one, or the connection closed
    Cancelled,
}

/// Receives the outcome of a path validation requested by the application
pub trait PathValidationDelegate {
    /// Validation of the path from `local` to `remote` ended
    fn on_path_validation_outcome(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        outcome: PathValidationOutcome,
    );
}

/// Why a path is being validated, which decides what happens once it ends
pub(super) enum ValidationReason {
    /// A server's peer migrated to an unvalidated address
    ReversePathValidation,
    /// A server received a probe from a new peer address
    ProbeReceived,
    /// The application asked for validation ahead of migrating
    Application(Box<dyn PathValidationDelegate>),
}

impl fmt::Debug for ValidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReversePathValidation => "ReversePathValidation",
            Self::ProbeReceived => "ProbeReceived",
            Self::Application(_) => "Application",
        })
    }
}

/// A validation that ended, handed back so the connection can act on it
#[derive(Debug)]
pub(super) struct Finished {
    pub(super) local: SocketAddr,
    pub(super) remote: SocketAddr,
    pub(super) reason: ValidationReason,
    pub(super) outcome: PathValidationOutcome,
}

impl Finished {
    /// Tell the application, if it asked for this validation
    pub(super) fn notify_delegate(&mut self) {
        if let ValidationReason::Application(delegate) = &mut self.reason {
            delegate.on_path_validation_outcome(self.local, self.remote, self.outcome);
        }
    }
}

/// What to do after the retry timer fired
#[derive(Debug)]
pub(super) enum RetryOutcome {
    /// Send a PATH_CHALLENGE with this payload and re-arm the timer
    Retry(u64),
    /// Every challenge went unanswered
    Failed(Finished),
    /// No validation is in progress
    Idle,
}

#[derive(Debug)]
struct Validation {
    local: SocketAddr,
    remote: SocketAddr,
    /// Payloads of every challenge sent so far; a response to any of them counts
    challenges: Vec<u64>,
    reason: ValidationReason,
}

/// PATH_CHALLENGE/PATH_RESPONSE bookkeeping for at most one path at a time
#[derive(Debug, Default)]
pub(super) struct PathValidator {
    state: Option<Validation>,
}

impl PathValidator {
    /// Begin validating `remote`, returning the first challenge payload
    ///
    /// A validation already in progress is cancelled and returned.
    pub(super) fn start<R: Rng>(
        &mut self,
        rng: &mut R,
        local: SocketAddr,
        remote: SocketAddr,
        reason: ValidationReason,
    ) -> (u64, Option<Finished>) {
        let previous = self.cancel();
        let challenge = rng.random();
        debug!(%local, %remote, ?reason, "starting path validation");
        self.state = Some(Validation {
            local,
            remote,
            challenges: vec![challenge],
            reason,
        });
        (challenge, previous)
    }

    /// Handle a PATH_RESPONSE that arrived on `local`
    pub(super) fn on_path_response(&mut self, payload: u64, local: SocketAddr) -> Option<Finished> {
        let validation = self.state.as_ref()?;
        if validation.local != local || !validation.challenges.contains(&payload) {
            trace!(payload, "ignoring PATH_RESPONSE that matches no outstanding challenge");
            return None;
        }
        self.finish(PathValidationOutcome::Validated)
    }

    /// The retry timer fired
    pub(super) fn on_retry_timeout<R: Rng>(&mut self, rng: &mut R) -> RetryOutcome {
        let Some(validation) = self.state.as_mut() else {
            return RetryOutcome::Idle;
        };
        if validation.challenges.len() as u32 > MAX_RETRY_TIMES {
            return match self.finish(PathValidationOutcome::TimedOut) {
                Some(finished) => RetryOutcome::Failed(finished),
                None => RetryOutcome::Idle,
            };
        }
        let challenge = rng.random();
        validation.challenges.push(challenge);
        trace!(retries = validation.challenges.len() - 1, "retrying PATH_CHALLENGE");
        RetryOutcome::Retry(challenge)
    }

    /// Abandon the validation in progress without a timeout
    pub(super) fn cancel(&mut self) -> Option<Finished> {
        self.finish(PathValidationOutcome::Cancelled)
    }

    pub(super) fn is_validating(&self) -> bool {
        self.state.is_some()
    }

    /// Whether the path to `remote` is the one under validation
    pub(super) fn is_validating_path(&self, remote: SocketAddr) -> bool {
        self.state.as_ref().is_some_and(|v| v.remote == remote)
    }

    /// Addresses of the path under validation
    pub(super) fn path(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.state.as_ref().map(|v| (v.local, v.remote))
    }

    fn finish(&mut self, outcome: PathValidationOutcome) -> Option<Finished> {
        let validation = self.state.take()?;
        debug!(remote = %validation.remote, ?outcome, "path validation finished");
        Some(Finished {
            local: validation.local,
            remote: validation.remote,
            reason: validation.reason,
            outcome,
        })
    }
}

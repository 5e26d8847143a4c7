//! `Expect: 100-continue` negotiation.

use http::{Method, StatusCode};

use crate::{
    client::{ContinuationConfig, ProtocolError},
    h1::BodyFraming,
};

/// How the continuation handshake of a request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationOutcome {
    /// Server answered `100 Continue`; the body was sent.
    Proceed,
    /// Server refused the body with a final status; the body was not sent.
    Rejected(StatusCode),
    /// Server did not answer in time; the body was sent anyway.
    TimedOutProceed,
}

/// Progress of one continuation handshake.
///
/// The default value describes a request that did not ask for permission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuationState {
    requested: bool,
    responded: bool,
    outcome: Option<ContinuationOutcome>,
}

impl ContinuationState {
    /// True if the request carried `Expect: 100-continue`.
    pub fn requested(&self) -> bool {
        self.requested
    }

    /// True if the server answered the handshake before its timeout.
    pub fn responded(&self) -> bool {
        self.responded
    }

    pub fn outcome(&self) -> Option<ContinuationOutcome> {
        self.outcome
    }
}

/// Returns true if a request should ask for permission before sending its body.
///
/// Only POST and PUT take part. Chunked bodies always negotiate; sized ones when they are
/// larger than the configured threshold.
pub(crate) fn should_engage(
    method: &Method,
    framing: BodyFraming,
    config: &ContinuationConfig,
) -> bool {
    if !config.enabled || !matches!(*method, Method::POST | Method::PUT) {
        return false;
    }

    match framing {
        BodyFraming::Chunked => true,
        BodyFraming::Length(len) => len > config.size_threshold,
        BodyFraming::Empty => false,
    }
}

fn is_rejection(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::METHOD_NOT_ALLOWED
            | StatusCode::PAYLOAD_TOO_LARGE
            | StatusCode::EXPECTATION_FAILED
    )
}

/// What the handler chain should do with a status seen during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Swallow the message, it belongs to the handshake.
    Consume,
    /// Pass the message on to response assembly.
    Forward,
}

/// Handler unit that interprets responses while a handshake is pending.
#[derive(Debug, Default)]
pub(crate) struct ContinuationHandler {
    state: ContinuationState,
}

impl ContinuationHandler {
    pub(crate) fn new() -> Self {
        ContinuationHandler {
            state: ContinuationState {
                requested: true,
                ..ContinuationState::default()
            },
        }
    }

    pub(crate) fn state(&self) -> ContinuationState {
        self.state
    }

    pub(crate) fn outcome(&self) -> Option<ContinuationOutcome> {
        self.state.outcome
    }

    /// True while the server has not answered and the timeout has not fired.
    pub(crate) fn is_pending(&self) -> bool {
        self.state.outcome.is_none()
    }

    /// Handles a status line or informational head.
    pub(crate) fn on_status(&mut self, status: StatusCode) -> Result<Verdict, ProtocolError> {
        if !self.is_pending() {
            // handshake settled; an interim 100 may still trail a timed out handshake
            return Ok(match (self.state.outcome, status) {
                (Some(ContinuationOutcome::Proceed), StatusCode::CONTINUE)
                | (Some(ContinuationOutcome::TimedOutProceed), StatusCode::CONTINUE) => {
                    Verdict::Consume
                }
                _ => Verdict::Forward,
            });
        }

        self.state.responded = true;

        if status == StatusCode::CONTINUE {
            log::trace!("server accepted request body");
            self.state.outcome = Some(ContinuationOutcome::Proceed);
            Ok(Verdict::Consume)
        } else if is_rejection(status) {
            log::debug!("server rejected request body with {status}");
            self.state.outcome = Some(ContinuationOutcome::Rejected(status));
            Ok(Verdict::Forward)
        } else {
            Err(ProtocolError::UnexpectedContinuation(status))
        }
    }

    /// Continuation timeout elapsed without an answer.
    pub(crate) fn on_timeout(&mut self) {
        if self.is_pending() {
            log::debug!("no answer to Expect: 100-continue, sending body anyway");
            self.state.outcome = Some(ContinuationOutcome::TimedOutProceed);
        }
    }
}

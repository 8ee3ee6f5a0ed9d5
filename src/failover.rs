//! Drives one request across its ordered backend candidates.

use bytes::Bytes;
use http::StatusCode;

use crate::config::Backend;
use crate::error::GatewayError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    AttemptingBackend(usize),
    Succeeded,
    ExhaustedFailed,
}

/// How a backend status affects failover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    /// Infrastructure failure: try the next candidate.
    Retryable,
    /// The request itself was refused: surface it.
    Rejected,
}

pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        return StatusClass::Success;
    }
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => StatusClass::Retryable,
        status if status.is_server_error() => StatusClass::Retryable,
        status if status.is_client_error() => StatusClass::Rejected,
        _ => StatusClass::Retryable,
    }
}

/// Result of one attempt as seen by the coordinator.
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The response was forwarded in full.
    Delivered,
    /// Failed before any response byte reached the client.
    Retryable(String),
    /// Backend refused the request; `body` is already in the client schema.
    Rejected { status: StatusCode, body: Bytes },
    /// Failed after response bytes were forwarded.
    Broken(String),
}

#[derive(Debug)]
pub struct FailoverCoordinator {
    backends: Vec<Backend>,
    state: AttemptState,
    attempted: Vec<String>,
    last_error: Option<String>,
}

impl FailoverCoordinator {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            backends,
            state: AttemptState::NotStarted,
            attempted: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Names of the backends attempted so far, in order.
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn current(&self) -> Option<&Backend> {
        match self.state {
            AttemptState::AttemptingBackend(index) => self.backends.get(index),
            _ => None,
        }
    }

    /// Moves to the head candidate.
    pub fn start(&mut self) -> Option<Backend> {
        if self.state != AttemptState::NotStarted {
            return None;
        }
        self.enter(0)
    }

    /// Records a retryable failure of the current attempt and moves to the
    /// next candidate. Once the response has started there is no next
    /// candidate.
    pub fn fail_retryable(
        &mut self,
        reason: impl Into<String>,
        response_started: bool,
    ) -> Option<Backend> {
        let AttemptState::AttemptingBackend(index) = self.state else {
            return None;
        };
        self.last_error = Some(reason.into());
        if response_started {
            self.state = AttemptState::ExhaustedFailed;
            return None;
        }
        self.enter(index + 1)
    }

    /// Records a failure that must not be retried elsewhere.
    pub fn fail_fatal(&mut self, reason: impl Into<String>) {
        self.last_error = Some(reason.into());
        self.state = AttemptState::ExhaustedFailed;
    }

    pub fn succeed(&mut self) {
        if matches!(self.state, AttemptState::AttemptingBackend(_)) {
            self.state = AttemptState::Succeeded;
        }
    }

    pub fn exhausted_error(&self) -> GatewayError {
        GatewayError::Exhausted {
            last: self
                .last_error
                .clone()
                .unwrap_or_else(|| "no backends configured".to_string()),
        }
    }

    fn enter(&mut self, index: usize) -> Option<Backend> {
        match self.backends.get(index) {
            Some(backend) => {
                self.state = AttemptState::AttemptingBackend(index);
                self.attempted.push(backend.name.clone());
                Some(backend.clone())
            }
            None => {
                self.state = AttemptState::ExhaustedFailed;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchemaName;

    fn coordinator(names: &[&str]) -> FailoverCoordinator {
        FailoverCoordinator::new(
            names
                .iter()
                .map(|name| Backend::new(*name, SchemaName::OpenAI))
                .collect(),
        )
    }

    #[test]
    fn classifies_statuses() {
        assert_eq!(classify_status(StatusCode::OK), StatusClass::Success);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), StatusClass::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            StatusClass::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT),
            StatusClass::Retryable
        );
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), StatusClass::Rejected);
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), StatusClass::Rejected);
    }

    #[test]
    fn advances_in_order_until_exhausted() {
        let mut failover = coordinator(&["a", "b"]);
        assert_eq!(failover.state(), AttemptState::NotStarted);
        assert_eq!(failover.start().map(|b| b.name), Some("a".to_string()));
        assert_eq!(
            failover.fail_retryable("connect refused", false).map(|b| b.name),
            Some("b".to_string())
        );
        assert_eq!(failover.state(), AttemptState::AttemptingBackend(1));
        assert!(failover.fail_retryable("status 503", false).is_none());
        assert_eq!(failover.state(), AttemptState::ExhaustedFailed);
        assert_eq!(failover.attempted(), ["a".to_string(), "b".to_string()]);

        let err = failover.exhausted_error();
        assert_eq!(err.to_string(), "all backends failed: status 503");
    }

    #[test]
    fn success_halts_attempts() {
        let mut failover = coordinator(&["a", "b"]);
        failover.start();
        failover.succeed();
        assert_eq!(failover.state(), AttemptState::Succeeded);
        assert!(failover.fail_retryable("late", false).is_none());
        assert_eq!(failover.attempted(), ["a".to_string()]);
    }

    #[test]
    fn no_advance_after_response_started() {
        let mut failover = coordinator(&["a", "b"]);
        failover.start();
        assert!(failover.fail_retryable("stream reset", true).is_none());
        assert_eq!(failover.state(), AttemptState::ExhaustedFailed);
        assert_eq!(failover.last_error(), Some("stream reset"));
    }

    #[test]
    fn fatal_failure_skips_remaining_candidates() {
        let mut failover = coordinator(&["a", "b"]);
        failover.start();
        failover.fail_fatal("status 400");
        assert_eq!(failover.state(), AttemptState::ExhaustedFailed);
        assert!(failover.current().is_none());
        assert_eq!(failover.attempted().len(), 1);
    }
}

//! Attempt bookkeeping for one logical request.

use crate::error::FetchError;

/// Result of a single HTTP attempt.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(Vec<u8>),
    Unauthorized,
    /// Any other status, or a transport-level error
    Failed(String),
}

/// What the transport does next.
#[derive(Debug)]
pub enum RetryDecision {
    Return(Vec<u8>),
    Reauthenticate,
    Retry(String),
    Fail(FetchError),
}

/// Attempt counter for the retry-with-reauthentication loop.
///
/// A 401 only triggers re-authentication when an owner is known and budget
/// remains; otherwise it is terminal. Other failures retry until the budget
/// is spent.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    max_attempts: u32,
    has_owner: bool,
}

impl RetryState {
    pub fn new(max_attempts: u32, has_owner: bool) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            has_owner,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn next(&mut self, outcome: AttemptOutcome) -> RetryDecision {
        self.attempts += 1;
        let budget_left = self.attempts < self.max_attempts;

        match outcome {
            AttemptOutcome::Success(body) => RetryDecision::Return(body),
            AttemptOutcome::Unauthorized if self.has_owner && budget_left => {
                RetryDecision::Reauthenticate
            }
            AttemptOutcome::Unauthorized => RetryDecision::Fail(FetchError::AuthenticationRequired),
            AttemptOutcome::Failed(cause) if budget_left => RetryDecision::Retry(cause),
            AttemptOutcome::Failed(cause) => RetryDecision::Fail(FetchError::RequestFailed(cause)),
        }
    }
}

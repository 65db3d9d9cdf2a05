//! Per-lookup retry policy as an explicit state machine.

use std::time::Duration;

use serde::Serialize;
use vlr_core::CandidateMatch;
use vlr_providers::ProviderError;
use vlr_storage::BackoffPolicy;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub backoff: BackoffPolicy,
    pub max_throttle_requeues: usize,
    pub max_throttle_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_throttle_requeues: 5,
            max_throttle_wait: Duration::from_secs(120),
        }
    }
}

/// Lifecycle of one (record, provider) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Pending,
    Querying { attempt: usize },
    Waiting { throttled: bool },
    Accepted,
    Rejected,
    Ambiguous,
    Errored,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailure {
    RetriesExhausted { attempts: usize, last_error: String },
    ThrottleLimit { requeues: usize },
    Fatal(String),
}

impl std::fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} attempt(s): {last_error}"),
            Self::ThrottleLimit { requeues } => {
                write!(f, "still throttled after {requeues} requeue(s)")
            }
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

/// What the driver should do next.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupStep {
    Query { attempt: usize },
    Wait { delay: Duration, throttled: bool },
    Done(Result<Vec<CandidateMatch>, LookupFailure>),
}

/// Drives retries for one lookup. The driver performs the I/O and feeds
/// each provider result back through [`LookupMachine::on_result`].
#[derive(Debug, Clone)]
pub struct LookupMachine {
    policy: RetryPolicy,
    state: PairState,
    attempts: usize,
    throttles: usize,
}

impl LookupMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: PairState::Pending,
            attempts: 0,
            throttles: 0,
        }
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    /// Provider calls issued so far, throttled calls included.
    pub fn attempts(&self) -> usize {
        self.attempts + self.throttles
    }

    pub fn throttles(&self) -> usize {
        self.throttles
    }

    /// Transient failures that were retried.
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }

    pub fn start(&mut self) -> LookupStep {
        self.query()
    }

    /// Leave a wait and issue the next query.
    pub fn resume(&mut self) -> LookupStep {
        self.query()
    }

    fn query(&mut self) -> LookupStep {
        let attempt = self.attempts + 1;
        self.state = PairState::Querying { attempt };
        LookupStep::Query { attempt }
    }

    pub fn on_result(&mut self, result: Result<Vec<CandidateMatch>, ProviderError>) -> LookupStep {
        match result {
            Ok(candidates) => {
                self.attempts += 1;
                self.finish(Ok(candidates))
            }
            Err(ProviderError::NotFound) => {
                self.attempts += 1;
                self.finish(Ok(Vec::new()))
            }
            Err(ProviderError::Throttled { retry_after_secs }) => {
                self.throttles += 1;
                if self.throttles > self.policy.max_throttle_requeues {
                    return self.finish(Err(LookupFailure::ThrottleLimit {
                        requeues: self.throttles - 1,
                    }));
                }
                self.state = PairState::Pending;
                LookupStep::Wait {
                    delay: Duration::from_secs(retry_after_secs).min(self.policy.max_throttle_wait),
                    throttled: true,
                }
            }
            Err(ProviderError::Transient(msg)) => {
                self.attempts += 1;
                if self.attempts >= self.policy.backoff.max_attempts.max(1) {
                    return self.finish(Err(LookupFailure::RetriesExhausted {
                        attempts: self.attempts,
                        last_error: msg,
                    }));
                }
                self.state = PairState::Waiting { throttled: false };
                LookupStep::Wait {
                    delay: self.policy.backoff.delay_for_attempt(self.attempts - 1),
                    throttled: false,
                }
            }
            Err(ProviderError::Fatal(msg)) => {
                self.attempts += 1;
                self.finish(Err(LookupFailure::Fatal(msg)))
            }
        }
    }

    fn finish(&mut self, result: Result<Vec<CandidateMatch>, LookupFailure>) -> LookupStep {
        self.state = match &result {
            Ok(_) => PairState::Querying {
                attempt: self.attempts,
            },
            Err(_) => PairState::Errored,
        };
        LookupStep::Done(result)
    }

    /// Record the matcher's verdict once candidates are in hand.
    pub fn settle(&mut self, state: PairState) {
        self.state = state;
    }
}

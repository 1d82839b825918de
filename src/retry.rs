//! Retry Controller.
//!
//! Retrying is modelled as explicit state: a [`RetryState`] records each
//! failure and answers with a [`RetryDecision`], either the instant the next
//! attempt becomes eligible or "give up". [`RetryController::run`] drives that
//! loop for a closure and waits through a [`Sleeper`], so tests (and
//! schedulers that would rather not block) can substitute their own.
//!
//! `max_retries` is the total number of attempts. Transient errors are
//! retried until it is reached; permanent errors fail immediately.

use crate::config::EtlConfig;
use crate::error::{ErrorClass, EtlError, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
    /// Seed for the deterministic jitter sequence.
    pub jitter_seed: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            jitter: true,
            jitter_seed: 0x5eed,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            jitter: config.jitter,
            ..Self::default()
        }
    }

    /// A policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
            ..Self::default()
        }
    }

    /// Delay after failed attempt number `attempt` (1-based):
    /// `base * 2^(attempt-1)`, capped at `max_backoff`, plus up to 25%
    /// deterministic jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_backoff.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max_backoff.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = 1u64 << attempt.saturating_sub(1).min(32);
        let delay_ms = base_ms.saturating_mul(exp).min(max_ms);
        if !self.jitter || delay_ms < 4 {
            return Duration::from_millis(delay_ms);
        }
        let noise = self
            .jitter_seed
            .wrapping_mul(6364136223846793005)
            .wrapping_add(u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        Duration::from_millis(delay_ms.saturating_add(noise % (delay_ms / 4)))
    }
}

/// What to do after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAt(Instant),
    GiveUp,
}

/// Retry bookkeeping for one operation.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    /// Attempts that have failed so far.
    pub attempt: u32,
    pub last_error_class: Option<ErrorClass>,
    pub last_error: Option<String>,
    pub next_eligible_at: Option<Instant>,
    exhausted: bool,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_error_class: None,
            last_error: None,
            next_eligible_at: None,
            exhausted: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt observed at `now`.
    pub fn record_failure(&mut self, err: &EtlError, now: Instant) -> RetryDecision {
        self.attempt += 1;
        let class = err.class();
        self.last_error_class = Some(class);
        self.last_error = Some(err.to_string());
        let at = if class == ErrorClass::Permanent || self.attempt >= self.policy.max_retries {
            None
        } else {
            now.checked_add(self.policy.backoff(self.attempt))
        };
        self.next_eligible_at = at;
        match at {
            Some(at) => RetryDecision::RetryAt(at),
            None => {
                self.exhausted = true;
                RetryDecision::GiveUp
            }
        }
    }

    /// Whether another attempt may start at `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        if self.exhausted || self.attempt >= self.policy.max_retries {
            return false;
        }
        if self.last_error_class == Some(ErrorClass::Permanent) {
            return false;
        }
        self.next_eligible_at.is_none_or(|at| now >= at)
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }
}

/// Waits out a backoff delay.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Returns immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSleeper;

impl Sleeper for NoopSleeper {
    fn sleep(&self, _delay: Duration) {}
}

/// Records requested delays without waiting.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(delay);
    }
}

/// Result of a controlled operation plus its retry history.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub retries: u32,
    pub state: RetryState,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs fallible operations under a [`RetryPolicy`].
pub struct RetryController<'s> {
    policy: RetryPolicy,
    sleeper: &'s dyn Sleeper,
}

impl std::fmt::Debug for RetryController<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<'s> RetryController<'s> {
    pub fn new(policy: RetryPolicy, sleeper: &'s dyn Sleeper) -> Self {
        Self { policy, sleeper }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Call `op` until it succeeds, fails permanently or exhausts the policy.
    ///
    /// `op` receives the 1-based attempt number. On exhaustion of a transient
    /// error the result is [`EtlError::RetriesExhausted`]; permanent errors
    /// are returned as-is.
    pub fn run<T, F>(&self, label: &str, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut state = RetryState::new(self.policy);
        loop {
            let attempt = state.attempt + 1;
            let err = match op(attempt) {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        retries: attempt - 1,
                        state,
                    };
                }
                Err(err) => err,
            };
            let now = Instant::now();
            match state.record_failure(&err, now) {
                RetryDecision::RetryAt(at) => {
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = self.policy.max_retries,
                        error = %err,
                        "transient failure, retrying"
                    );
                    self.sleeper.sleep(at.saturating_duration_since(now));
                }
                RetryDecision::GiveUp => {
                    let result = if err.is_retryable() {
                        error!(operation = label, attempts = attempt, error = %err, "retries exhausted");
                        Err(EtlError::RetriesExhausted {
                            operation: label.to_string(),
                            attempts: attempt,
                            last: Box::new(err),
                        })
                    } else {
                        Err(err)
                    };
                    return RetryOutcome {
                        result,
                        attempts: attempt,
                        retries: attempt - 1,
                        state,
                    };
                }
            }
        }
    }
}

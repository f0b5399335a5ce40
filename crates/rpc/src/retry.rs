//! Bounded retry combinator
//!
//! Every retry loop in the crate goes through [`run_with_retries`]. Callers
//! supply the attempt itself and a policy that turns a failure into either a
//! delay before the next attempt or an abort.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::RpcError;

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately
    None,

    /// `base + step * attempt`
    Linear { base: Duration, step: Duration },

    /// `base * 2^attempt`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { base, step } => base.saturating_add(step.saturating_mul(attempt)),
            Backoff::Exponential { base, max } => {
                let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Abort,
}

/// Failure of a whole retry run
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Attempts actually made
    pub attempts: u32,

    /// Error of the last attempt
    pub error: E,

    /// Whether the policy stopped the run before the budget was used up
    pub aborted: bool,
}

impl RetryFailure<RpcError> {
    /// Convert into the error surfaced to callers.
    ///
    /// An aborted run yields the original error; an exhausted one is wrapped
    /// with the description and attempt count.
    pub fn into_error(self, description: &str) -> RpcError {
        if self.aborted {
            self.error
        } else {
            RpcError::RetriesExhausted {
                description: description.to_string(),
                attempts: self.attempts,
                last_error: Box::new(self.error),
            }
        }
    }
}

/// Run `op` up to `max_attempts` times.
///
/// `op` receives the 1-based attempt number. `decide` is consulted after
/// every failure, the last one included, but its delay is only honored when
/// another attempt follows.
pub async fn run_with_retries<T, E, Op, Fut, Decide>(
    max_attempts: u32,
    mut op: Op,
    mut decide: Decide,
) -> Result<T, RetryFailure<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Decide: FnMut(u32, &E) -> RetryDecision,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match decide(attempt, &error) {
            RetryDecision::Abort => {
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                    aborted: true,
                })
            }
            RetryDecision::Retry(_) if attempt >= max_attempts => {
                return Err(RetryFailure {
                    attempts: attempt,
                    error,
                    aborted: false,
                })
            }
            RetryDecision::Retry(delay) => {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        }

        attempt += 1;
    }
}

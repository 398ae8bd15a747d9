//! Backoff executor
//!
//! Retries a fallible async unit of work with exponentially growing delays.
//! Holds no state between calls; every call owns its policy and counters.

use crate::error::AgentError;
use crate::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(120);

/// Retry configuration passed into every `execute` call
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations of the work, including the first one
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    /// Prefix of the `RetryExhausted` message
    pub on_failure_message: String,
    /// Upper bound for a single wait
    pub max_delay: Duration,
    /// Wall-clock budget for the whole call, waits included
    pub max_elapsed: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_multiplier: f64,
        on_failure_message: impl Into<String>,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_multiplier,
            on_failure_message: on_failure_message.into(),
            max_delay: DEFAULT_MAX_DELAY,
            max_elapsed: Some(DEFAULT_MAX_ELAPSED),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Option<Duration>) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }

    pub fn with_failure_message(mut self, message: impl Into<String>) -> Self {
        self.on_failure_message = message.into();
        self
    }

    /// Delay that follows `current`, capped at `max_delay`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        let scaled = current.as_secs_f64() * self.backoff_multiplier;
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32, last: AgentError) -> AgentError {
        AgentError::RetryExhausted {
            message: self.on_failure_message.clone(),
            attempts,
            source: Box::new(last),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_INITIAL_DELAY,
            DEFAULT_MULTIPLIER,
            "Operation failed after multiple retries",
        )
    }
}

/// Run `work` under `policy`, retrying errors that report `is_retryable()`.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, work: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_with(policy, AgentError::is_retryable, work).await
}

/// Same as [`execute`] with a caller-supplied retry classification.
///
/// Errors rejected by `should_retry` are returned unchanged. Once the attempt
/// budget or the elapsed budget runs out the last error is wrapped in
/// `AgentError::RetryExhausted`.
pub async fn execute_with<T, F, Fut, P>(
    policy: &RetryPolicy,
    should_retry: P,
    mut work: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&AgentError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let started = Instant::now();
    let mut delay = policy.initial_delay.min(policy.max_delay);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let error = match work().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !should_retry(&error) {
            debug!(attempt, error = %error, "Error is not retryable");
            return Err(error);
        }

        let remaining = max_attempts - attempt;
        if remaining == 0 {
            warn!(attempts = attempt, error = %error, "{}", policy.on_failure_message);
            return Err(policy.exhausted(attempt, error));
        }

        if let Some(budget) = policy.max_elapsed {
            if started.elapsed().saturating_add(delay) > budget {
                warn!(
                    attempts = attempt,
                    budget_ms = budget.as_millis() as u64,
                    "Retry budget exhausted before next attempt"
                );
                return Err(policy.exhausted(attempt, error));
            }
        }

        warn!(
            attempts_remaining = remaining,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying operation, {} attempts remaining",
            remaining
        );

        sleep(delay).await;
        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn failing_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(500), 2.0, "Completion failed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_uses_every_attempt() {
        for n in 1..=5 {
            let calls = Arc::new(AtomicU32::new(0));
            let counter = Arc::clone(&calls);

            let result: Result<()> = execute(&failing_policy(n).with_max_elapsed(None), || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AgentError::TransientProvider("connection reset".into()))
                }
            })
            .await;

            assert_eq!(calls.load(Ordering::SeqCst), n);
            match result {
                Err(AgentError::RetryExhausted { attempts, message, source }) => {
                    assert_eq!(attempts, n);
                    assert_eq!(message, "Completion failed");
                    assert!(matches!(*source, AgentError::TransientProvider(_)));
                }
                other => panic!("expected RetryExhausted, got {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_invokes_work_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = execute(&failing_policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_double_between_attempts() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&stamps);

        let result: Result<()> = execute(&failing_policy(3), || {
            let recorder = Arc::clone(&recorder);
            async move {
                recorder.lock().unwrap().push(Instant::now());
                Err(AgentError::TransientProvider("timeout".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AgentError::RetryExhausted { attempts: 3, .. })));

        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 3);
        assert_eq!(stamps[1] - stamps[0], Duration::from_millis(500));
        assert_eq!(stamps[2] - stamps[1], Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = execute(&failing_policy(4), || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(AgentError::TransientProvider("busy".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = execute(&failing_policy(5), || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::UnsupportedProvider("venice".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AgentError::UnsupportedProvider(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = failing_policy(10).with_max_delay(Duration::from_secs(2));
        let mut delay = policy.initial_delay;
        for _ in 0..8 {
            delay = policy.next_delay(delay);
        }
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_budget_stops_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        // 500 + 1000 fits in 2s, the following 2000ms wait does not.
        let policy = failing_policy(10).with_max_elapsed(Some(Duration::from_secs(2)));

        let result: Result<()> = execute(&policy, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::TransientProvider("down".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AgentError::RetryExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = execute_with(&failing_policy(3), |_| true, || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(AgentError::Config("flaky".into()))
            }
        })
        .await;

        tokio_test::assert_err!(result);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_delay_stops_at_elapsed_budget() {
        let policy = RetryPolicy::new(5, Duration::MAX, 2.0, "Completion failed")
            .with_max_delay(Duration::MAX)
            .with_max_elapsed(Some(Duration::from_secs(1)));

        let result: Result<()> = execute(&policy, || async {
            Err(AgentError::TransientProvider("timeout".into()))
        })
        .await;

        assert!(matches!(result, Err(AgentError::RetryExhausted { attempts: 1, .. })));
    }
}

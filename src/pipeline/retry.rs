//! Retry with exponential backoff and hard call timeouts for capability
//! calls. Retries happen inside a stage attempt; only an exhausted policy
//! surfaces as a paper failure.

use std::sync::mpsc;
use std::time::Duration;

use rand::Rng;

use super::capability::CapabilityError;

/// Backoff parameters for one class of capability calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock ceiling for a single capability call.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            call_timeout: Duration::from_secs(600),
        }
    }
}

/// A capability call that kept failing after every allowed attempt.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempt(s): {error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub error: CapabilityError,
}

impl RetryPolicy {
    /// Deterministic backoff before retry number `attempt` (1-based),
    /// doubling from the base and capped. Jitter is added at sleep time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent.
    pub fn run<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, CapabilityError>,
    ) -> Result<T, RetryExhausted> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let delay = jittered(self.delay_for(attempt));
                    tracing::warn!(%label, attempt, ?delay, %error, "Capability call failed, retrying");
                    std::thread::sleep(delay);
                }
                Err(error) => {
                    tracing::error!(%label, attempt, %error, "Capability call failed");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        error,
                    });
                }
            }
        }
    }

    /// Run a single call on its own thread with a hard deadline. On timeout
    /// the call is abandoned; its thread ends when the call returns.
    pub fn call_with_timeout<T, F>(&self, op: F) -> Result<T, CapabilityError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, CapabilityError> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(op());
        });
        match rx.recv_timeout(self.call_timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(CapabilityError::Timeout(self.call_timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(CapabilityError::Transient("capability call panicked".into()))
            }
        }
    }
}

/// Half-jitter: the deterministic delay plus up to 50% extra.
fn jittered(delay: Duration) -> Duration {
    let extra = rand::thread_rng().gen_range(0..=delay.as_millis().max(1) as u64 / 2);
    delay + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            call_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn transient_failures_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast_policy().run("test", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CapabilityError::Transient("503".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn fatal_failure_stops_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast_policy().run("test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CapabilityError::Fatal("bad key".into()))
        });
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhaustion_reports_attempt_count() {
        let result: Result<(), _> = fast_policy().run("test", || {
            Err(CapabilityError::Transient("flaky".into()))
        });
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.error, CapabilityError::Transient(_)));
    }

    #[test]
    fn slow_call_times_out() {
        let policy = fast_policy();
        let result: Result<(), _> = policy.call_with_timeout(|| {
            std::thread::sleep(Duration::from_secs(5));
            Ok(())
        });
        assert!(matches!(result.unwrap_err(), CapabilityError::Timeout(_)));
    }

    #[test]
    fn fast_call_passes_through() {
        let result = fast_policy().call_with_timeout(|| Ok("done"));
        assert_eq!(result.unwrap(), "done");
    }

    #[test]
    fn panicking_call_surfaces_as_transient() {
        let result: Result<(), _> = fast_policy().call_with_timeout(|| panic!("boom"));
        assert!(matches!(result.unwrap_err(), CapabilityError::Transient(_)));
    }
}

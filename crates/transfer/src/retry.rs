//! Retry bookkeeping shared by every transfer loop.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::TransferError;
use crate::config::TransferConfig;

/// Granularity at which backoff sleeps notice cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(20);

/// Full-jitter exponential backoff bounded by a progress-less attempt budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_progressless: u32,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_progressless: config.max_progressless_retries,
            max_delay: config.max_retry_delay(),
        }
    }

    /// `min(random() * 2^progressless, max_delay)`.
    pub fn delay(&self, progressless: u32) -> Duration {
        let ceiling = 2f64.powi(progressless.min(62) as i32);
        let secs = rand::thread_rng().gen_range(0.0..1.0) * ceiling;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            progressless: 0,
            last_progress: 0,
        }
    }

    /// Runs a call that moves no bytes until it succeeds, fails
    /// permanently, or the budget runs out.
    pub fn run<T>(
        &self,
        cancel: &CancellationToken,
        what: &str,
        mut op: impl FnMut() -> Result<T, TransferError>,
    ) -> Result<T, TransferError> {
        let mut state = self.start();
        loop {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let delay = state.on_failure(e, 0, what)?;
                    sleep(cancel, delay)?;
                }
            }
        }
    }
}

/// Per-transfer retry counters.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    progressless: u32,
    last_progress: u64,
}

impl RetryState {
    pub fn progressless(&self) -> u32 {
        self.progressless
    }

    /// Records a failed attempt that left `bytes_done` bytes durably
    /// transferred.
    ///
    /// Non-retryable errors are returned as-is. A retryable error yields the
    /// delay to wait before the next attempt, or [`TransferError::RetriesExhausted`]
    /// once too many attempts in a row made no progress.
    pub fn on_failure(
        &mut self,
        error: TransferError,
        bytes_done: u64,
        what: &str,
    ) -> Result<Duration, TransferError> {
        if !error.is_retryable() {
            return Err(error);
        }
        if bytes_done > self.last_progress {
            self.last_progress = bytes_done;
            self.progressless = 0;
        } else {
            self.progressless += 1;
        }
        if self.progressless > self.policy.max_progressless {
            return Err(TransferError::RetriesExhausted {
                attempts: self.progressless,
                last: Box::new(error),
            });
        }
        let delay = self.policy.delay(self.progressless);
        warn!(
            transfer = what,
            bytes_done,
            progressless = self.progressless,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after transient failure"
        );
        Ok(delay)
    }
}

/// Sleeps for `delay`, returning early with [`TransferError::Cancelled`].
pub fn sleep(cancel: &CancellationToken, delay: Duration) -> Result<(), TransferError> {
    let mut remaining = delay;
    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if remaining.is_zero() {
            return Ok(());
        }
        let step = remaining.min(SLEEP_SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use stowage_store::StoreError;

    fn policy(max: u32) -> RetryPolicy {
        RetryPolicy {
            max_progressless: max,
            max_delay: Duration::from_millis(1),
        }
    }

    fn transient() -> TransferError {
        TransferError::Store(StoreError::Service {
            status: 503,
            message: "busy".into(),
        })
    }

    #[test]
    fn delay_is_bounded() {
        let p = RetryPolicy {
            max_progressless: 23,
            max_delay: Duration::from_secs(32),
        };
        for n in 0..30 {
            let d = p.delay(n);
            assert!(d <= Duration::from_secs(32));
            assert!(d.as_secs_f64() < 2f64.powi(n as i32));
        }
    }

    #[test]
    fn progress_resets_counter() {
        let mut state = policy(2).start();
        state.on_failure(transient(), 0, "t").unwrap();
        state.on_failure(transient(), 0, "t").unwrap();
        assert_eq!(state.progressless(), 2);
        state.on_failure(transient(), 10, "t").unwrap();
        assert_eq!(state.progressless(), 0);
    }

    #[test]
    fn exhausts_after_budget() {
        let mut state = policy(2).start();
        state.on_failure(transient(), 0, "t").unwrap();
        state.on_failure(transient(), 0, "t").unwrap();
        let err = state.on_failure(transient(), 0, "t").unwrap_err();
        assert!(matches!(err, TransferError::RetriesExhausted { attempts: 3, .. }));
    }

    #[test]
    fn permanent_errors_pass_through() {
        let mut state = policy(5).start();
        let err = state
            .on_failure(
                TransferError::Store(StoreError::NotFound("x".into())),
                0,
                "t",
            )
            .unwrap_err();
        assert!(matches!(err, TransferError::Store(StoreError::NotFound(_))));
        assert_eq!(state.progressless(), 0);
    }

    #[test]
    fn run_retries_transient_calls() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let value = policy(3)
            .run(&cancel, "t", || {
                calls += 1;
                if calls < 3 { Err(transient()) } else { Ok(calls) }
            })
            .unwrap();
        assert_eq!(value, 3);

        let err = policy(1)
            .run(&cancel, "t", || Err::<(), _>(transient()))
            .unwrap_err();
        assert!(matches!(err, TransferError::RetriesExhausted { attempts: 2, .. }));
    }

    #[test]
    fn sleep_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        let err = sleep(&cancel, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}

//! Sink writes with exponential backoff.
//!
//! Transient failures (`SinkError::Unavailable`, timeouts) are retried with
//! `base * factor^(n-1)` delays, capped at `max_delay`, until `max_attempts`
//! tries are used up. Rejections are never retried.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::sink::{Batch, Sink, SinkError};

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Total tries including the first one.
    pub max_attempts: u32,
    /// Upper bound for a single sink call.
    pub write_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            factor: 2.0,
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl BackoffConfig {
    /// Delay before try `attempt` (1-indexed). The first try has none.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let base_us = self.base_delay.as_micros() as f64 * self.factor.powi((attempt - 2) as i32);
        let capped = base_us.min(self.max_delay.as_micros() as f64);
        Duration::from_micros(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written { attempts: u32 },
    Failed { error: SinkError, attempts: u32 },
    /// Shutdown force-closed the worker mid-write or mid-backoff.
    Cancelled { attempts: u32 },
}

/// Write `batch` to `sink`, retrying transient failures. `on_retry` is
/// called before every retry with the attempt number and the last error.
pub async fn write_with_retry(
    sink: &dyn Sink,
    batch: &Batch,
    config: &BackoffConfig,
    cancel: &CancellationToken,
    mut on_retry: impl FnMut(u32, &SinkError),
) -> WriteOutcome {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let delay = config.delay_for_attempt(attempt);
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return WriteOutcome::Cancelled { attempts: attempt - 1 },
            }
        }

        let result = tokio::select! {
            res = tokio::time::timeout(config.write_timeout, sink.write_batch(batch)) => match res {
                Ok(r) => r,
                Err(_) => Err(SinkError::Unavailable(format!(
                    "write timed out after {:?}",
                    config.write_timeout
                ))),
            },
            _ = cancel.cancelled() => return WriteOutcome::Cancelled { attempts: attempt },
        };

        match result {
            Ok(()) => {
                if attempt > 1 {
                    tracing::info!(
                        sink = %batch.sink(),
                        batch = batch.id(),
                        attempt,
                        "write recovered after retry"
                    );
                }
                return WriteOutcome::Written { attempts: attempt };
            }
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    sink = %batch.sink(),
                    batch = batch.id(),
                    attempt,
                    delay_ms = config.delay_for_attempt(attempt + 1).as_millis() as u64,
                    error = %error,
                    "sink write failed, retrying"
                );
                on_retry(attempt, &error);
            }
            Err(error) => return WriteOutcome::Failed { error, attempts: attempt },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{SinkKind, Batch};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails with the queued errors, then succeeds.
    struct Scripted {
        errors: Mutex<Vec<SinkError>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(mut errors: Vec<SinkError>) -> Self {
            errors.reverse();
            Scripted {
                errors: Mutex::new(errors),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Sink for Scripted {
        async fn write_batch(&self, _batch: &Batch) -> Result<(), SinkError> {
            *self.calls.lock().unwrap() += 1;
            match self.errors.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    fn fast() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts: 3,
            write_timeout: Duration::from_secs(1),
        }
    }

    fn empty_batch() -> Batch {
        Batch::new(7, SinkKind::TimeSeries, Vec::new())
    }

    fn unavailable() -> SinkError {
        SinkError::Unavailable("down".into())
    }

    #[test]
    fn test_delay_schedule() {
        let config = BackoffConfig::default();
        assert_eq!(config.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(1600));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let sink = Scripted::new(vec![unavailable(), unavailable()]);
        let mut retries = Vec::new();
        let outcome = write_with_retry(&sink, &empty_batch(), &fast(), &CancellationToken::new(), |n, _| {
            retries.push(n)
        })
        .await;
        assert_eq!(outcome, WriteOutcome::Written { attempts: 3 });
        assert_eq!(retries, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let sink = Scripted::new(vec![unavailable(); 5]);
        let cancel = CancellationToken::new();
        let outcome = write_with_retry(&sink, &empty_batch(), &fast(), &cancel, |_, _| {}).await;
        assert_eq!(outcome, WriteOutcome::Failed { error: unavailable(), attempts: 3 });
        assert_eq!(sink.calls(), 3);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let rejected = SinkError::Rejected("constraint".into());
        let sink = Scripted::new(vec![rejected.clone()]);
        let cancel = CancellationToken::new();
        let outcome = write_with_retry(&sink, &empty_batch(), &fast(), &cancel, |_, _| {}).await;
        assert_eq!(outcome, WriteOutcome::Failed { error: rejected, attempts: 1 });
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_during_backoff() {
        let sink = Scripted::new(vec![unavailable(); 5]);
        let mut config = fast();
        config.base_delay = Duration::from_secs(60);
        config.max_delay = Duration::from_secs(60);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let outcome = write_with_retry(&sink, &empty_batch(), &config, &cancel, |_, _| {}).await;
        assert_eq!(outcome, WriteOutcome::Cancelled { attempts: 1 });
    }
}

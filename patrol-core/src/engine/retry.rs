use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RetrySection;

use super::error::{Disposition, EngineError, EngineResult};
use super::events::{EngineEvent, EventSink};

#[derive(Debug, Clone)]
pub struct RetryOutcome<T> {
    pub result: T,
    pub attempts: usize,
}

/// Bounded retry with exponential backoff and jitter around an arbitrary
/// fallible async operation. Terminal errors (per the classifier) return
/// immediately; retryable ones sleep `min(base * 2^(n-1), max)` plus a
/// uniform jitter in `[0, base)` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
    classify: fn(&EngineError) -> Disposition,
}

impl RetryPolicy {
    pub fn new(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: section.base_delay(),
            max_delay: section.max_delay(),
            classify: super::error::default_disposition,
        }
    }

    pub fn with_classifier(mut self, classify: fn(&EngineError) -> Disposition) -> Self {
        self.classify = classify;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as u32;
        let backoff = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter_ms = self.base_delay.as_millis() as u64;
        if jitter_ms > 0 {
            backoff + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        } else {
            backoff
        }
    }

    pub async fn execute<F, Fut, T>(
        &self,
        target: &str,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
        mut operation: F,
    ) -> EngineResult<RetryOutcome<T>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 1usize;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled());
            }
            sink.record(&EngineEvent::AttemptStarted {
                target: target.to_string(),
                attempt,
            });
            let started = Instant::now();
            let result = operation(attempt).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            sink.record(&EngineEvent::AttemptFinished {
                target: target.to_string(),
                attempt,
                success: result.is_ok(),
                elapsed_ms,
                error: result.as_ref().err().map(|err| err.to_string()),
            });

            let error = match result {
                Ok(result) => {
                    return Ok(RetryOutcome {
                        result,
                        attempts: attempt,
                    })
                }
                Err(error) => error,
            };

            if (self.classify)(&error) == Disposition::Terminal {
                return Err(error);
            }
            if attempt >= self.max_attempts {
                return Err(EngineError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(error),
                });
            }

            let delay = self.delay_for_attempt(attempt);
            sink.record(&EngineEvent::RetryScheduled {
                target: target.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
            });
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::Cancelled {
                        last_error: Some(Box::new(error)),
                    });
                }
                _ = sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

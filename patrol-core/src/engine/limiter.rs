use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::RateSection;

use super::error::{EngineError, EngineResult};
use super::events::{EngineEvent, EventSink};

/// How long a blocked `wait` sleeps between admission checks.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket admitting on average `refill_per_second` requests with a
/// burst allowance of `capacity`. All mutation happens under the bucket's
/// own lock; buckets for different targets never contend.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    wait_timeout: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(section: &RateSection) -> Self {
        let capacity = section.capacity.max(1.0);
        Self {
            capacity,
            refill_rate: section.refill_per_second,
            wait_timeout: section.wait_timeout(),
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills from elapsed time and consumes one token when available.
    pub fn try_acquire(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(st.last_refill).as_secs_f64();
        st.tokens = (st.tokens + elapsed * self.refill_rate).min(self.capacity);
        st.last_refill = now;
        if st.tokens >= 1.0 {
            st.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Blocks until a token is available, the configured wait timeout
    /// elapses, or the caller is cancelled.
    pub async fn wait(
        &self,
        target: &str,
        cancel: &CancellationToken,
        sink: &dyn EventSink,
    ) -> EngineResult<()> {
        let started = Instant::now();
        let deadline = started + self.wait_timeout;
        loop {
            if self.try_acquire() {
                let waited = started.elapsed();
                if !waited.is_zero() {
                    sink.record(&EngineEvent::RateLimitWait {
                        target: target.to_string(),
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::RateLimitTimeout {
                    target: target.to_string(),
                });
            }
            let pause = RETRY_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::cancelled()),
                _ = sleep(pause) => {}
            }
        }
    }
}

/// Process-wide map of buckets, one per target, created lazily on first
/// use. Mirrors the breaker registry.
pub struct RateLimiterRegistry {
    section: RateSection,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("section", &self.section)
            .finish()
    }
}

impl RateLimiterRegistry {
    pub fn new(section: RateSection) -> Self {
        Self {
            section,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn bucket(&self, target: &str) -> Arc<TokenBucket> {
        let mut map = self.buckets.lock().unwrap();
        if let Some(existing) = map.get(target) {
            return Arc::clone(existing);
        }
        let created = Arc::new(TokenBucket::new(&self.section));
        map.insert(target.to_string(), Arc::clone(&created));
        created
    }
}

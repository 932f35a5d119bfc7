use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::BreakerSection;

use super::events::{EngineEvent, EventSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
struct BreakerState {
    circuit: CircuitState,
    failures: u32,
    open_until: Option<Instant>,
    backoff: Duration,
}

/// Per-target failure-isolation gate. Closed admits everything; Open
/// rejects until its deadline passes; HalfOpen admits exactly one trial,
/// enforced by a compare-and-swap on the trial flag so concurrent callers
/// in the same instant cannot both get through.
pub struct CircuitBreaker {
    target: String,
    threshold: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    multiplier: f64,
    state: Mutex<BreakerState>,
    trial_in_flight: AtomicBool,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.target)
            .field("threshold", &self.threshold)
            .field("state", &self.state)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(target: &str, section: &BreakerSection, sink: Arc<dyn EventSink>) -> Self {
        let base_backoff = section.open_timeout();
        Self {
            target: target.to_string(),
            threshold: section.failure_threshold.max(1),
            base_backoff,
            max_backoff: section.open_timeout_max().max(base_backoff),
            multiplier: section.backoff_multiplier.max(1.0),
            state: Mutex::new(BreakerState {
                circuit: CircuitState::Closed,
                failures: 0,
                open_until: None,
                backoff: base_backoff,
            }),
            trial_in_flight: AtomicBool::new(false),
            sink,
        }
    }

    /// Gate check before an attempt. Open circuits whose deadline has
    /// passed move to HalfOpen here, admitting a single trial caller.
    pub fn allow(&self) -> bool {
        let mut st = self.state.lock().unwrap();
        match st.circuit {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = st
                    .open_until
                    .map(|deadline| Instant::now() >= deadline)
                    .unwrap_or(true);
                if !elapsed {
                    return false;
                }
                self.transition(&mut st, CircuitState::HalfOpen);
                self.trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            }
            CircuitState::HalfOpen => self
                .trial_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
        }
    }

    pub fn record_success(&self) {
        let mut st = self.state.lock().unwrap();
        match st.circuit {
            CircuitState::Closed => st.failures = 0,
            CircuitState::HalfOpen => {
                // Stale reporters lost the trial flag already; ignore them.
                if self.trial_in_flight.swap(false, Ordering::AcqRel) {
                    st.failures = 0;
                    st.open_until = None;
                    st.backoff = self.base_backoff;
                    self.transition(&mut st, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut st = self.state.lock().unwrap();
        match st.circuit {
            CircuitState::Closed => {
                st.failures += 1;
                if st.failures >= self.threshold {
                    self.open(&mut st);
                }
            }
            CircuitState::HalfOpen => {
                if self.trial_in_flight.swap(false, Ordering::AcqRel) {
                    let grown = st.backoff.as_secs_f64() * self.multiplier;
                    st.backoff = Duration::from_secs_f64(grown.min(self.max_backoff.as_secs_f64()));
                    self.open(&mut st);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap().circuit
    }

    fn open(&self, st: &mut BreakerState) {
        st.open_until = Some(Instant::now() + st.backoff);
        self.trial_in_flight.store(false, Ordering::Release);
        self.transition(st, CircuitState::Open);
    }

    fn transition(&self, st: &mut BreakerState, to: CircuitState) {
        let from = st.circuit;
        st.circuit = to;
        self.sink.record(&EngineEvent::CircuitTransition {
            target: self.target.clone(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
}

/// Process-wide map of breakers, one per target, created lazily on first
/// use and kept for the lifetime of the process.
pub struct BreakerRegistry {
    section: BreakerSection,
    sink: Arc<dyn EventSink>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("section", &self.section)
            .finish()
    }
}

impl BreakerRegistry {
    pub fn new(section: BreakerSection, sink: Arc<dyn EventSink>) -> Self {
        Self {
            section,
            sink,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        let mut map = self.breakers.lock().unwrap();
        if let Some(existing) = map.get(target) {
            return Arc::clone(existing);
        }
        let created = Arc::new(CircuitBreaker::new(
            target,
            &self.section,
            Arc::clone(&self.sink),
        ));
        map.insert(target.to_string(), Arc::clone(&created));
        created
    }
}

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Structured engine events for metrics and logging sinks. The engine emits
/// these on a best-effort basis; a sink must never influence control flow.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    AttemptStarted {
        target: String,
        attempt: usize,
    },
    AttemptFinished {
        target: String,
        attempt: usize,
        success: bool,
        elapsed_ms: u64,
        error: Option<String>,
    },
    RetryScheduled {
        target: String,
        attempt: usize,
        delay_ms: u64,
    },
    CircuitTransition {
        target: String,
        from: String,
        to: String,
    },
    RateLimitWait {
        target: String,
        waited_ms: u64,
    },
    SessionOpened {
        session: Uuid,
    },
    SessionDiscarded {
        session: Uuid,
        reason: String,
    },
    TargetFinished {
        target: String,
        success: bool,
        attempts: usize,
        elapsed_ms: u64,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &EngineEvent);
}

/// Sink that drops everything. Correctness never depends on a sink being
/// present.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &EngineEvent) {}
}

/// Sink that forwards events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &EngineEvent) {
        match event {
            EngineEvent::AttemptStarted { target, attempt } => {
                debug!(target_name = %target, attempt, "attempt started");
            }
            EngineEvent::AttemptFinished {
                target,
                attempt,
                success,
                elapsed_ms,
                error,
            } => {
                if *success {
                    debug!(target_name = %target, attempt, elapsed_ms, "attempt finished");
                } else {
                    warn!(
                        target_name = %target,
                        attempt,
                        elapsed_ms,
                        error = error.as_deref().unwrap_or("unknown"),
                        "attempt failed"
                    );
                }
            }
            EngineEvent::RetryScheduled {
                target,
                attempt,
                delay_ms,
            } => {
                info!(target_name = %target, attempt, delay_ms, "retry scheduled");
            }
            EngineEvent::CircuitTransition { target, from, to } => {
                info!(target_name = %target, from = %from, to = %to, "circuit transition");
            }
            EngineEvent::RateLimitWait { target, waited_ms } => {
                debug!(target_name = %target, waited_ms, "rate limit wait");
            }
            EngineEvent::SessionOpened { session } => {
                debug!(session = %session, "session opened");
            }
            EngineEvent::SessionDiscarded { session, reason } => {
                debug!(session = %session, reason = %reason, "session discarded");
            }
            EngineEvent::TargetFinished {
                target,
                success,
                attempts,
                elapsed_ms,
            } => {
                info!(
                    target_name = %target,
                    success,
                    attempts,
                    elapsed_ms,
                    "target finished"
                );
            }
        }
    }
}

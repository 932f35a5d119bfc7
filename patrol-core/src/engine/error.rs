use std::time::Duration;

use thiserror::Error;

use crate::driver::DriverError;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("session pool exhausted after {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("session pool is closed")]
    PoolClosed,
    #[error("session creation failed: {0}")]
    SessionCreate(#[source] DriverError),
    #[error("circuit open for target {target}")]
    CircuitOpen { target: String },
    #[error("rate limit wait timed out for target {target}")]
    RateLimitTimeout { target: String },
    #[error("step '{step}' timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },
    #[error("workflow for target {target} timed out after {timeout:?}")]
    WorkflowTimeout { target: String, timeout: Duration },
    #[error("required field '{field}' missing in step '{step}'")]
    MissingRequiredField { step: String, field: String },
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        attempts: usize,
        #[source]
        source: Box<EngineError>,
    },
    #[error("cancelled")]
    Cancelled {
        #[source]
        last_error: Option<Box<EngineError>>,
    },
    #[error("session marked unhealthy: {source}")]
    SessionUnhealthy {
        #[source]
        source: DriverError,
    },
    #[error("credential '{key}' unavailable for target {target}")]
    Credentials { target: String, key: String },
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
}

impl EngineError {
    pub fn cancelled() -> Self {
        EngineError::Cancelled { last_error: None }
    }

    /// Default classification. Gate denials and structural failures are
    /// terminal: retrying against an open circuit or a missing required
    /// field only burns attempts. Everything I/O-shaped is retryable.
    pub fn disposition(&self) -> Disposition {
        match self {
            EngineError::CircuitOpen { .. }
            | EngineError::RateLimitTimeout { .. }
            | EngineError::PoolClosed
            | EngineError::MissingRequiredField { .. }
            | EngineError::Credentials { .. }
            | EngineError::Cancelled { .. }
            | EngineError::RetriesExhausted { .. } => Disposition::Terminal,
            EngineError::PoolExhausted { .. }
            | EngineError::SessionCreate(_)
            | EngineError::StepTimeout { .. }
            | EngineError::WorkflowTimeout { .. }
            | EngineError::SessionUnhealthy { .. }
            | EngineError::Driver(_) => Disposition::Retryable,
        }
    }
}

pub fn default_disposition(error: &EngineError) -> Disposition {
    error.disposition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_denials_are_terminal() {
        let err = EngineError::CircuitOpen {
            target: "shop".into(),
        };
        assert_eq!(err.disposition(), Disposition::Terminal);
        let err = EngineError::RateLimitTimeout {
            target: "shop".into(),
        };
        assert_eq!(err.disposition(), Disposition::Terminal);
    }

    #[test]
    fn broken_sessions_are_retryable() {
        let err = EngineError::SessionUnhealthy {
            source: DriverError::ConnectionLost("ws closed".into()),
        };
        assert_eq!(err.disposition(), Disposition::Retryable);
    }
}

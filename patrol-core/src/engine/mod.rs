pub mod breaker;
pub mod error;
pub mod events;
pub mod executor;
pub mod limiter;
pub mod orchestrator;
pub mod pool;
pub mod retry;

pub use breaker::{BreakerRegistry, CircuitBreaker, CircuitState};
pub use error::{default_disposition, Disposition, EngineError, EngineResult};
pub use events::{EngineEvent, EventSink, NullSink, TracingSink};
pub use executor::{StepExecutor, WorkflowPhase};
pub use limiter::{RateLimiterRegistry, TokenBucket};
pub use orchestrator::Orchestrator;
pub use pool::{PooledSession, Session, SessionPool};
pub use retry::{RetryOutcome, RetryPolicy};

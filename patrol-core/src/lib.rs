pub mod artifact;
pub mod chromium;
pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod secrets;
pub mod target;
pub mod telemetry;
pub mod urls;

pub use artifact::{FailureProbe, HtmlSnapshotProbe, NoopProbe};
pub use chromium::ChromiumDriver;
pub use config::{
    load_patrol_config, load_targets, BreakerSection, ChromiumSection, ObservabilitySection,
    PatrolConfig, PoolSection, RateSection, RetrySection, RunnerSection,
};
pub use driver::{DriverError, DriverResult, PageSession, SessionDriver};
pub use engine::{
    BreakerRegistry, CircuitBreaker, CircuitState, Disposition, EngineError, EngineEvent,
    EngineResult, EventSink, NullSink, Orchestrator, PooledSession, RateLimiterRegistry,
    RetryOutcome, RetryPolicy, SessionPool, StepExecutor, TokenBucket, TracingSink, WorkflowPhase,
};
pub use error::{ConfigError, Result};
pub use secrets::{ChainedCredentials, CredentialStore, DirCredentials, EnvCredentials};
pub use target::{
    AttemptRecord, FieldSpec, LoginSpec, Step, StepAction, Target, TargetResult, WaitCondition,
};
pub use telemetry::{RunTelemetry, TelemetryError};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::target::WaitCondition;

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by a remote-automation driver. The engine only inspects
/// `is_connection_fatal` to decide whether a session may be reused.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("driver launch failed: {0}")]
    Launch(String),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    /// Whether the underlying session should be destroyed rather than
    /// returned to the pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::ConnectionLost(_) | DriverError::Protocol(_) | DriverError::Launch(_)
        )
    }
}

/// One live page-level automation session. Implementations must be safe to
/// drive from a single task at a time; the pool guarantees exclusivity.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn navigate(&self, url: &str) -> DriverResult<()>;

    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> DriverResult<()>;

    /// Reads the first element matching `selector`. Returns `Ok(None)` when
    /// no element matches; driver-level failures are errors.
    async fn extract(&self, selector: &str, attribute: Option<&str>)
        -> DriverResult<Option<String>>;

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()>;

    async fn click(&self, selector: &str) -> DriverResult<()>;

    async fn current_url(&self) -> DriverResult<String>;

    /// Full page markup, used by failure probes to persist snapshots.
    async fn page_source(&self) -> DriverResult<String>;

    async fn close(&self) -> DriverResult<()>;
}

/// Factory for page sessions. The pool is the only caller of `open`.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn open(&self) -> DriverResult<Box<dyn PageSession>>;
}

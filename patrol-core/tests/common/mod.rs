#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use patrol_core::{
    BreakerRegistry, BreakerSection, CredentialStore, DriverError, DriverResult, EventSink,
    NoopProbe, NullSink, PageSession, PoolSection, RateLimiterRegistry, RateSection, RetryPolicy,
    RetrySection, RunnerSection, SessionDriver, SessionPool, StepExecutor, Target, WaitCondition,
};

/// Scripted behavior shared by every page a `MockDriver` opens.
#[derive(Default)]
pub struct SiteModel {
    /// selector -> extracted value; selectors absent here extract to None.
    pub values: Mutex<HashMap<String, String>>,
    /// Number of upcoming navigate calls that fail with a transient error.
    pub nav_failures: AtomicUsize,
    /// Simulated navigation latency.
    pub nav_delay_ms: AtomicU64,
    /// Every driver call, for assertions on ordering and login flows.
    pub actions: Mutex<Vec<String>>,
}

impl SiteModel {
    pub fn with_values(pairs: &[(&str, &str)]) -> Arc<Self> {
        let model = Self::default();
        {
            let mut values = model.values.lock().unwrap();
            for (selector, value) in pairs {
                values.insert(selector.to_string(), value.to_string());
            }
        }
        Arc::new(model)
    }

    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    fn log(&self, action: String) {
        self.actions.lock().unwrap().push(action);
    }
}

pub struct MockDriver {
    pub model: Arc<SiteModel>,
    pub opened: AtomicUsize,
}

impl MockDriver {
    pub fn new(model: Arc<SiteModel>) -> Arc<Self> {
        Arc::new(Self {
            model,
            opened: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SessionDriver for MockDriver {
    async fn open(&self) -> DriverResult<Box<dyn PageSession>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPage {
            model: Arc::clone(&self.model),
        }))
    }
}

pub struct MockPage {
    model: Arc<SiteModel>,
}

#[async_trait]
impl PageSession for MockPage {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        self.model.log(format!("navigate {url}"));
        let delay = self.model.nav_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let remaining = self.model.nav_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.model.nav_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::Navigation("upstream returned 503".into()));
        }
        Ok(())
    }

    async fn wait_for(&self, condition: &WaitCondition, _timeout: Duration) -> DriverResult<()> {
        self.model.log(format!("wait_for {condition}"));
        match condition {
            WaitCondition::Selector { selector } if selector == "#absent" => {
                Err(DriverError::Timeout(selector.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn extract(
        &self,
        selector: &str,
        _attribute: Option<&str>,
    ) -> DriverResult<Option<String>> {
        self.model.log(format!("extract {selector}"));
        Ok(self.model.values.lock().unwrap().get(selector).cloned())
    }

    async fn fill(&self, selector: &str, _value: &str) -> DriverResult<()> {
        self.model.log(format!("fill {selector}"));
        Ok(())
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        self.model.log(format!("click {selector}"));
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok("https://mock.example.com/".into())
    }

    async fn page_source(&self) -> DriverResult<String> {
        Ok("<html></html>".into())
    }

    async fn close(&self) -> DriverResult<()> {
        self.model.log("close".into());
        Ok(())
    }
}

/// Credentials that always resolve, for login-flow tests.
pub struct StaticCredentials;

impl CredentialStore for StaticCredentials {
    fn resolve(&self, _target: &str, key: &str) -> Option<String> {
        Some(format!("secret-{key}"))
    }
}

/// Credentials that never resolve.
pub struct EmptyCredentials;

impl CredentialStore for EmptyCredentials {
    fn resolve(&self, _target: &str, _key: &str) -> Option<String> {
        None
    }
}

pub struct Harness {
    pub pool: Arc<SessionPool>,
    pub breakers: Arc<BreakerRegistry>,
    pub limiters: Arc<RateLimiterRegistry>,
    pub executor: Arc<StepExecutor>,
}

pub fn harness(driver: Arc<MockDriver>, credentials: Arc<dyn CredentialStore>) -> Harness {
    harness_with(driver, credentials, 2, 3)
}

pub fn harness_with(
    driver: Arc<MockDriver>,
    credentials: Arc<dyn CredentialStore>,
    max_sessions: usize,
    max_attempts: usize,
) -> Harness {
    let sink: Arc<dyn EventSink> = Arc::new(NullSink);
    let runner = RunnerSection {
        max_concurrency: 4,
        step_timeout_ms: 5_000,
        workflow_timeout_ms: 60_000,
        probe_grace_ms: 500,
        artifacts_dir: None,
    };
    let pool = Arc::new(SessionPool::new(
        driver,
        &PoolSection {
            max_sessions,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 60_000,
            close_grace_ms: 1_000,
        },
        Arc::clone(&sink),
    ));
    let breakers = Arc::new(BreakerRegistry::new(
        BreakerSection {
            failure_threshold: 5,
            open_timeout_ms: 1_000,
            open_timeout_max_ms: 8_000,
            backoff_multiplier: 1.0,
        },
        Arc::clone(&sink),
    ));
    let limiters = Arc::new(RateLimiterRegistry::new(RateSection {
        capacity: 100.0,
        refill_per_second: 100.0,
        wait_timeout_ms: 5_000,
    }));
    let retry = RetryPolicy::new(&RetrySection {
        max_attempts,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
    });
    let executor = Arc::new(StepExecutor::new(
        Arc::clone(&pool),
        Arc::clone(&breakers),
        Arc::clone(&limiters),
        retry,
        credentials,
        Arc::new(NoopProbe),
        sink,
        &runner,
    ));
    Harness {
        pool,
        breakers,
        limiters,
        executor,
    }
}

pub fn target(raw: &str) -> Target {
    let target: Target = toml::from_str(raw).expect("test target should parse");
    target.validate().expect("test target should validate");
    target
}

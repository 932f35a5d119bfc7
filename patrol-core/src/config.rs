use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::target::Target;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PatrolConfig {
    pub runner: RunnerSection,
    pub pool: PoolSection,
    pub breaker: BreakerSection,
    pub rate: RateSection,
    pub retry: RetrySection,
    pub chromium: ChromiumSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    pub max_concurrency: usize,
    pub step_timeout_ms: u64,
    pub workflow_timeout_ms: u64,
    pub probe_grace_ms: u64,
    pub artifacts_dir: Option<String>,
}

impl RunnerSection {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn workflow_timeout(&self) -> Duration {
        Duration::from_millis(self.workflow_timeout_ms)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_millis(self.probe_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    pub max_sessions: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub close_grace_ms: u64,
}

impl PoolSection {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub open_timeout_ms: u64,
    pub open_timeout_max_ms: u64,
    pub backoff_multiplier: f64,
}

impl BreakerSection {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn open_timeout_max(&self) -> Duration {
        Duration::from_millis(self.open_timeout_max_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateSection {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub wait_timeout_ms: u64,
}

impl RateSection {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetrySection {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChromiumSection {
    pub executable_path: Option<String>,
    pub headless: bool,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub request_timeout_ms: Option<u64>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub metrics_db: String,
}

pub fn load_patrol_config<P: AsRef<Path>>(path: P) -> Result<PatrolConfig> {
    let config: PatrolConfig = load_toml(&path)?;
    if config.runner.max_concurrency == 0 {
        return Err(invalid(&path, "runner.max_concurrency must be at least 1"));
    }
    if config.pool.max_sessions == 0 {
        return Err(invalid(&path, "pool.max_sessions must be at least 1"));
    }
    if config.breaker.failure_threshold == 0 {
        return Err(invalid(&path, "breaker.failure_threshold must be at least 1"));
    }
    if config.rate.capacity < 1.0 || config.rate.refill_per_second <= 0.0 {
        return Err(invalid(
            &path,
            "rate.capacity must be >= 1 and rate.refill_per_second > 0",
        ));
    }
    if config.retry.max_attempts == 0 {
        return Err(invalid(&path, "retry.max_attempts must be at least 1"));
    }
    Ok(config)
}

#[derive(Debug, Clone, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<Target>,
}

/// Loads and validates the `[[targets]]` file. Every target is checked
/// structurally and target names must be unique across the file.
pub fn load_targets<P: AsRef<Path>>(path: P) -> Result<Vec<Target>> {
    let file: TargetsFile = load_toml(&path)?;
    let mut seen = std::collections::HashSet::new();
    for target in &file.targets {
        target
            .validate()
            .map_err(|message| invalid(&path, &message))?;
        if !seen.insert(target.name.clone()) {
            return Err(invalid(
                &path,
                &format!("duplicate target name '{}'", target.name),
            ));
        }
    }
    Ok(file.targets)
}

fn invalid<P: AsRef<Path>>(path: P, message: &str) -> ConfigError {
    ConfigError::Invalid {
        path: path.as_ref().to_path_buf(),
        message: message.to_string(),
    }
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

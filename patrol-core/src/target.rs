use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// One remote site and the ordered workflow to run against it. Immutable
/// once validated; owned by the orchestrator for the duration of a run.
#[derive(Debug, Clone, Deserialize)]
pub struct Target {
    pub name: String,
    pub base_url: Url,
    #[serde(default)]
    pub login: Option<LoginSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Default per-step budget; falls back to the runner-wide default.
    #[serde(default)]
    pub step_timeout_ms: Option<u64>,
    /// Budget for one whole workflow attempt.
    #[serde(default)]
    pub workflow_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    Navigate { url: String },
    WaitFor { condition: WaitCondition },
    Extract { fields: Vec<FieldSpec> },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Navigate { .. } => "navigate",
            StepAction::WaitFor { .. } => "wait_for",
            StepAction::Extract { .. } => "extract",
        }
    }
}

/// Condition a step or login flow can block on.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WaitCondition {
    Selector { selector: String },
    UrlContains { url_contains: String },
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitCondition::Selector { selector } => write!(f, "selector {selector}"),
            WaitCondition::UrlContains { url_contains } => {
                write!(f, "url contains {url_contains}")
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub selector: String,
    /// Attribute to read; element text when absent.
    #[serde(default)]
    pub attribute: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Form-based login executed right after a session is acquired for the
/// target. Credential values are looked up by key at runtime, never stored
/// in target files.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginSpec {
    pub url: String,
    pub username_selector: String,
    pub password_selector: String,
    pub submit_selector: String,
    pub username_key: String,
    pub password_key: String,
    #[serde(default)]
    pub wait_for: Option<WaitCondition>,
}

impl Target {
    pub fn step_timeout(&self, step: &Step, default: Duration) -> Duration {
        step.timeout_ms
            .or(self.step_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    pub fn workflow_timeout(&self, default: Duration) -> Duration {
        self.workflow_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(default)
    }

    /// Structural validation applied after deserialization: non-empty
    /// names, unique step names, unique field names per step, sane
    /// timeouts.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("target name cannot be empty".into());
        }
        if self.steps.is_empty() {
            return Err(format!("target '{}' has no steps", self.name));
        }
        if self.step_timeout_ms == Some(0) || self.workflow_timeout_ms == Some(0) {
            return Err(format!("target '{}' has a zero timeout", self.name));
        }
        let mut step_names = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(format!("target '{}' has an unnamed step", self.name));
            }
            if !step_names.insert(step.name.as_str()) {
                return Err(format!(
                    "duplicate step name '{}' in target '{}'",
                    step.name, self.name
                ));
            }
            if step.timeout_ms == Some(0) {
                return Err(format!(
                    "step '{}' in target '{}' has a zero timeout",
                    step.name, self.name
                ));
            }
            if let StepAction::Extract { fields } = &step.action {
                if fields.is_empty() {
                    return Err(format!(
                        "extract step '{}' in target '{}' has no fields",
                        step.name, self.name
                    ));
                }
                let mut field_names = HashSet::new();
                for field in fields {
                    if field.name.trim().is_empty() || field.selector.trim().is_empty() {
                        return Err(format!(
                            "step '{}' in target '{}' has a field with an empty name or selector",
                            step.name, self.name
                        ));
                    }
                    if !field_names.insert(field.name.as_str()) {
                        return Err(format!(
                            "duplicate field name '{}' in step '{}' of target '{}'",
                            field.name, step.name, self.name
                        ));
                    }
                }
            }
        }
        if let Some(login) = &self.login {
            if login.username_key.trim().is_empty() || login.password_key.trim().is_empty() {
                return Err(format!(
                    "login for target '{}' has empty credential keys",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

/// Outcome of a single workflow attempt, kept for observability.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub success: bool,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

/// Final per-target outcome handed back to the orchestrator's caller.
/// Always carries the best-effort field map, even on failure.
#[derive(Debug, Clone, Serialize)]
pub struct TargetResult {
    pub target: String,
    pub success: bool,
    pub fields: BTreeMap<String, String>,
    pub attempts: usize,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

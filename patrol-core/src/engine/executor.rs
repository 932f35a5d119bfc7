use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifact::FailureProbe;
use crate::config::RunnerSection;
use crate::driver::{DriverError, DriverResult, PageSession};
use crate::secrets::CredentialStore;
use crate::target::{AttemptRecord, LoginSpec, Step, StepAction, Target, TargetResult};
use crate::urls;

use super::breaker::{BreakerRegistry, CircuitBreaker};
use super::error::{EngineError, EngineResult};
use super::events::{EngineEvent, EventSink};
use super::limiter::{RateLimiterRegistry, TokenBucket};
use super::pool::{PooledSession, SessionPool};
use super::retry::RetryPolicy;

/// Where a workflow attempt currently is. Failure is reachable from every
/// phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowPhase {
    Idle,
    Navigating,
    Waiting,
    Extracting,
    Done,
    Failed,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Idle => "idle",
            WorkflowPhase::Navigating => "navigating",
            WorkflowPhase::Waiting => "waiting",
            WorkflowPhase::Extracting => "extracting",
            WorkflowPhase::Done => "done",
            WorkflowPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable state shared across the retry attempts of one target run.
/// Fields accumulate so a failed run still reports everything extracted so
/// far, and `next_step` lets a retry re-enter the workflow where it broke.
#[derive(Debug, Default)]
struct Progress {
    next_step: usize,
    fields: BTreeMap<String, String>,
    attempts: Vec<AttemptRecord>,
}

/// Drives one target's ordered workflow through a pooled session, gated by
/// the target's circuit breaker and rate bucket, wrapped by the retry
/// policy.
pub struct StepExecutor {
    pool: Arc<SessionPool>,
    breakers: Arc<BreakerRegistry>,
    limiters: Arc<RateLimiterRegistry>,
    retry: RetryPolicy,
    credentials: Arc<dyn CredentialStore>,
    probe: Arc<dyn FailureProbe>,
    sink: Arc<dyn EventSink>,
    step_timeout: Duration,
    workflow_timeout: Duration,
    probe_grace: Duration,
}

impl fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutor")
            .field("step_timeout", &self.step_timeout)
            .field("workflow_timeout", &self.workflow_timeout)
            .finish()
    }
}

impl StepExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<SessionPool>,
        breakers: Arc<BreakerRegistry>,
        limiters: Arc<RateLimiterRegistry>,
        retry: RetryPolicy,
        credentials: Arc<dyn CredentialStore>,
        probe: Arc<dyn FailureProbe>,
        sink: Arc<dyn EventSink>,
        runner: &RunnerSection,
    ) -> Self {
        Self {
            pool,
            breakers,
            limiters,
            retry,
            credentials,
            probe,
            sink,
            step_timeout: runner.step_timeout(),
            workflow_timeout: runner.workflow_timeout(),
            probe_grace: runner.probe_grace(),
        }
    }

    /// Runs the full workflow for one target and always produces a result;
    /// a failed target is data, not a process error.
    pub async fn run_target(&self, target: &Target, cancel: &CancellationToken) -> TargetResult {
        let started = Instant::now();
        let progress = Mutex::new(Progress::default());
        let breaker = self.breakers.breaker(&target.name);

        let outcome = self
            .retry
            .execute(&target.name, cancel, self.sink.as_ref(), |attempt| {
                self.attempt_workflow(target, cancel, &progress, attempt)
            })
            .await;

        let progress = progress.into_inner().unwrap();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (success, attempts, error) = match outcome {
            Ok(outcome) => {
                breaker.record_success();
                (true, outcome.attempts, None)
            }
            Err(err) => {
                // A cancelled run says nothing about the target's health,
                // and a circuit denial already happened on the breaker's
                // terms; neither counts as a fresh failure.
                if !matches!(
                    err,
                    EngineError::Cancelled { .. } | EngineError::CircuitOpen { .. }
                ) {
                    breaker.record_failure();
                }
                (false, progress.attempts.len(), Some(err.to_string()))
            }
        };
        self.sink.record(&EngineEvent::TargetFinished {
            target: target.name.clone(),
            success,
            attempts,
            elapsed_ms,
        });
        info!(
            target_name = %target.name,
            success,
            attempts,
            elapsed_ms,
            "target run finished"
        );

        TargetResult {
            target: target.name.clone(),
            success,
            fields: progress.fields,
            attempts,
            elapsed_ms,
            error,
        }
    }

    async fn attempt_workflow(
        &self,
        target: &Target,
        cancel: &CancellationToken,
        progress: &Mutex<Progress>,
        attempt: usize,
    ) -> EngineResult<()> {
        let attempt_started = Instant::now();
        let workflow_timeout = target.workflow_timeout(self.workflow_timeout);
        let result = match timeout(
            workflow_timeout,
            self.drive_steps(target, cancel, progress),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(EngineError::WorkflowTimeout {
                target: target.name.clone(),
                timeout: workflow_timeout,
            }),
        };

        let mut guard = progress.lock().unwrap();
        guard.attempts.push(AttemptRecord {
            attempt,
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
            elapsed_ms: attempt_started.elapsed().as_millis() as u64,
        });
        result
    }

    async fn drive_steps(
        &self,
        target: &Target,
        cancel: &CancellationToken,
        progress: &Mutex<Progress>,
    ) -> EngineResult<()> {
        let breaker = self.breakers.breaker(&target.name);
        let bucket = self.limiters.bucket(&target.name);
        let mut session: Option<PooledSession> = None;
        let mut phase = WorkflowPhase::Idle;
        let mut failed_at = String::from("workflow");

        let result = self
            .step_loop(
                target,
                cancel,
                progress,
                &breaker,
                &bucket,
                &mut session,
                &mut phase,
                &mut failed_at,
            )
            .await;

        match &result {
            Ok(()) => {
                phase = WorkflowPhase::Done;
                debug!(target_name = %target.name, phase = %phase, "workflow complete");
                if let Some(leased) = session.take() {
                    leased.release(true);
                }
            }
            Err(error) => {
                phase = WorkflowPhase::Failed;
                let healthy = !matches!(error, EngineError::SessionUnhealthy { .. });
                if let Some(leased) = session.take() {
                    self.invoke_probe(&target.name, &failed_at, leased.page(), error)
                        .await;
                    leased.release(healthy);
                }
                debug!(
                    target_name = %target.name,
                    phase = %phase,
                    step = %failed_at,
                    error = %error,
                    "workflow attempt failed"
                );
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn step_loop(
        &self,
        target: &Target,
        cancel: &CancellationToken,
        progress: &Mutex<Progress>,
        breaker: &Arc<CircuitBreaker>,
        bucket: &Arc<TokenBucket>,
        session: &mut Option<PooledSession>,
        phase: &mut WorkflowPhase,
        failed_at: &mut String,
    ) -> EngineResult<()> {
        let start_index = progress.lock().unwrap().next_step;
        if start_index > 0 {
            debug!(
                target_name = %target.name,
                step_index = start_index,
                "resuming workflow from failed step"
            );
        }

        for index in start_index..target.steps.len() {
            let step = &target.steps[index];
            failed_at.clone_from(&step.name);
            if cancel.is_cancelled() {
                return Err(EngineError::cancelled());
            }
            // Gate order matters: a denied circuit must not consume a
            // rate token or a pooled session.
            if !breaker.allow() {
                return Err(EngineError::CircuitOpen {
                    target: target.name.clone(),
                });
            }
            bucket
                .wait(&target.name, cancel, self.sink.as_ref())
                .await?;

            if session.is_none() {
                let leased = self.pool.acquire(cancel).await?;
                if let Some(login) = &target.login {
                    *failed_at = String::from("login");
                    match self.login(target, login, leased.page()).await {
                        Ok(()) => failed_at.clone_from(&step.name),
                        Err(error) => {
                            let healthy = !matches!(error, EngineError::SessionUnhealthy { .. });
                            self.invoke_probe(&target.name, "login", leased.page(), &error)
                                .await;
                            leased.release(healthy);
                            return Err(error);
                        }
                    }
                }
                *session = Some(leased);
            }

            let leased = session.as_ref().expect("session held for step");
            let limit = target.step_timeout(step, self.step_timeout);
            self.run_step(target, step, leased.page(), limit, phase, progress)
                .await?;
            progress.lock().unwrap().next_step = index + 1;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        target: &Target,
        step: &Step,
        page: &dyn PageSession,
        limit: Duration,
        phase: &mut WorkflowPhase,
        progress: &Mutex<Progress>,
    ) -> EngineResult<()> {
        match &step.action {
            StepAction::Navigate { url } => {
                *phase = WorkflowPhase::Navigating;
                let resolved = urls::resolve(&target.base_url, url).map_err(|err| {
                    EngineError::Driver(DriverError::Navigation(format!(
                        "invalid url '{url}': {err}"
                    )))
                })?;
                debug!(target_name = %target.name, step = %step.name, url = %resolved, "navigate");
                self.bounded(&step.name, limit, page.navigate(resolved.as_str()))
                    .await?;
            }
            StepAction::WaitFor { condition } => {
                *phase = WorkflowPhase::Waiting;
                debug!(target_name = %target.name, step = %step.name, condition = %condition, "wait");
                self.bounded(&step.name, limit, page.wait_for(condition, limit))
                    .await?;
            }
            StepAction::Extract { fields } => {
                *phase = WorkflowPhase::Extracting;
                for field in fields {
                    let value = self
                        .bounded(
                            &step.name,
                            limit,
                            page.extract(&field.selector, field.attribute.as_deref()),
                        )
                        .await?;
                    match value {
                        Some(value) => {
                            progress
                                .lock()
                                .unwrap()
                                .fields
                                .insert(field.name.clone(), value);
                        }
                        None if field.required => {
                            return Err(EngineError::MissingRequiredField {
                                step: step.name.clone(),
                                field: field.name.clone(),
                            });
                        }
                        None => {
                            debug!(
                                target_name = %target.name,
                                step = %step.name,
                                field = %field.name,
                                "optional field absent"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn login(
        &self,
        target: &Target,
        login: &LoginSpec,
        page: &dyn PageSession,
    ) -> EngineResult<()> {
        let username = self
            .credentials
            .resolve(&target.name, &login.username_key)
            .ok_or_else(|| EngineError::Credentials {
                target: target.name.clone(),
                key: login.username_key.clone(),
            })?;
        let password = self
            .credentials
            .resolve(&target.name, &login.password_key)
            .ok_or_else(|| EngineError::Credentials {
                target: target.name.clone(),
                key: login.password_key.clone(),
            })?;

        let limit = target
            .step_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.step_timeout);
        let url = urls::resolve(&target.base_url, &login.url).map_err(|err| {
            EngineError::Driver(DriverError::Navigation(format!(
                "invalid login url '{}': {err}",
                login.url
            )))
        })?;

        info!(target_name = %target.name, "running login flow");
        self.bounded("login", limit, page.navigate(url.as_str()))
            .await?;
        self.bounded("login", limit, page.fill(&login.username_selector, &username))
            .await?;
        self.bounded("login", limit, page.fill(&login.password_selector, &password))
            .await?;
        self.bounded("login", limit, page.click(&login.submit_selector))
            .await?;
        if let Some(condition) = &login.wait_for {
            self.bounded("login", limit, page.wait_for(condition, limit))
                .await?;
        }
        Ok(())
    }

    /// Applies the step budget and maps driver failures: driver timeouts
    /// become `StepTimeout`, connection-fatal errors become
    /// `SessionUnhealthy` so the pool destroys the session.
    async fn bounded<T, F>(&self, step: &str, limit: Duration, fut: F) -> EngineResult<T>
    where
        F: Future<Output = DriverResult<T>>,
    {
        match timeout(limit, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(DriverError::Timeout(_))) => Err(EngineError::StepTimeout {
                step: step.to_string(),
                timeout: limit,
            }),
            Ok(Err(err)) if err.is_connection_fatal() => {
                Err(EngineError::SessionUnhealthy { source: err })
            }
            Ok(Err(err)) => Err(EngineError::Driver(err)),
            Err(_) => Err(EngineError::StepTimeout {
                step: step.to_string(),
                timeout: limit,
            }),
        }
    }

    async fn invoke_probe(
        &self,
        target: &str,
        step: &str,
        page: &dyn PageSession,
        error: &EngineError,
    ) {
        let probing = self.probe.on_failure(target, step, page, error);
        if timeout(self.probe_grace, probing).await.is_err() {
            warn!(
                target_name = %target,
                step = %step,
                "failure probe exceeded its grace period"
            );
        }
    }
}

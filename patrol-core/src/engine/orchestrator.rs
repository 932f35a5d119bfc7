use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::target::{Target, TargetResult};

use super::error::EngineError;
use super::executor::StepExecutor;

/// Fans one task per target across a bounded worker pool and collects
/// every result. Cancelling the root token stops admission of new targets
/// and drains in-flight ones promptly; partial completion is normal.
#[derive(Debug)]
pub struct Orchestrator {
    executor: Arc<StepExecutor>,
    max_concurrency: usize,
}

impl Orchestrator {
    pub fn new(executor: Arc<StepExecutor>, max_concurrency: usize) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub async fn run(&self, targets: Vec<Target>, cancel: &CancellationToken) -> Vec<TargetResult> {
        let total = targets.len();
        info!(targets = total, workers = self.max_concurrency, "run started");
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut tasks = JoinSet::new();

        for target in targets {
            let executor = Arc::clone(&self.executor);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return cancelled_result(&target),
                    },
                    _ = cancel.cancelled() => return cancelled_result(&target),
                };
                if cancel.is_cancelled() {
                    return cancelled_result(&target);
                }
                executor.run_target(&target, &cancel).await
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "target worker aborted"),
            }
        }
        let succeeded = results.iter().filter(|result| result.success).count();
        info!(
            targets = total,
            succeeded,
            failed = results.len() - succeeded,
            "run finished"
        );
        results
    }
}

fn cancelled_result(target: &Target) -> TargetResult {
    TargetResult {
        target: target.name.clone(),
        success: false,
        fields: BTreeMap::new(),
        attempts: 0,
        elapsed_ms: 0,
        error: Some(EngineError::cancelled().to_string()),
    }
}

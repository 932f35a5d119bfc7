use std::sync::Arc;

use patrol_core::{
    load_patrol_config, load_targets, BreakerRegistry, ChainedCredentials, ChromiumDriver,
    CredentialStore, DirCredentials, EnvCredentials, EventSink, FailureProbe, HtmlSnapshotProbe,
    NoopProbe, Orchestrator, RateLimiterRegistry, RetryPolicy, RunTelemetry, SessionDriver,
    SessionPool, StepExecutor, TargetResult, TracingSink,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Cli, Result, RunArgs};

pub async fn execute(cli: &Cli, args: &RunArgs) -> Result<()> {
    let config = load_patrol_config(&cli.config)?;
    let mut targets = load_targets(&cli.targets)?;
    if !args.only.is_empty() {
        targets.retain(|target| args.only.iter().any(|name| name == &target.name));
    }
    if targets.is_empty() {
        warn!("no targets selected; nothing to do");
        return Ok(());
    }

    let sink: Arc<dyn EventSink> = match RunTelemetry::new(
        &config.observability.failure_log,
        &config.observability.metrics_db,
    ) {
        Ok(telemetry) => Arc::new(telemetry),
        Err(err) => {
            warn!(error = %err, "telemetry unavailable, falling back to log-only sink");
            Arc::new(TracingSink)
        }
    };

    let credentials = build_credentials(cli);
    let probe: Arc<dyn FailureProbe> = match &config.runner.artifacts_dir {
        Some(dir) => Arc::new(HtmlSnapshotProbe::new(dir)),
        None => Arc::new(NoopProbe),
    };

    let mut chromium = config.chromium.clone();
    if args.headed {
        chromium.headless = false;
    }
    let driver = Arc::new(ChromiumDriver::launch(chromium).await?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling run");
                cancel.cancel();
            }
        });
    }

    let mut results = {
        let pool = Arc::new(SessionPool::new(
            Arc::clone(&driver) as Arc<dyn SessionDriver>,
            &config.pool,
            Arc::clone(&sink),
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.clone(),
            Arc::clone(&sink),
        ));
        let limiters = Arc::new(RateLimiterRegistry::new(config.rate.clone()));
        let retry = RetryPolicy::new(&config.retry);
        let executor = Arc::new(StepExecutor::new(
            Arc::clone(&pool),
            breakers,
            limiters,
            retry,
            credentials,
            probe,
            Arc::clone(&sink),
            &config.runner,
        ));
        let workers = args.max_concurrency.unwrap_or(config.runner.max_concurrency);
        let orchestrator = Orchestrator::new(executor, workers);

        let results = orchestrator.run(targets, &cancel).await;
        pool.close(config.pool.close_grace()).await;
        results
    };

    match Arc::try_unwrap(driver) {
        Ok(driver) => {
            if let Err(err) = driver.shutdown().await {
                warn!(error = %err, "browser shutdown failed");
            }
        }
        Err(_) => warn!("browser still referenced, skipping explicit shutdown"),
    }

    results.sort_by(|a, b| a.target.cmp(&b.target));
    let rendered = serde_json::to_string_pretty(&results)?;
    std::fs::write(&args.out, rendered)?;
    info!(path = %args.out.display(), "results written");

    print_summary(cli, &results)?;
    Ok(())
}

fn build_credentials(cli: &Cli) -> Arc<dyn CredentialStore> {
    match &cli.secrets_dir {
        Some(dir) => Arc::new(ChainedCredentials::new(vec![
            Arc::new(EnvCredentials::default()),
            Arc::new(DirCredentials::new(dir.clone())),
        ])),
        None => Arc::new(EnvCredentials::default()),
    }
}

fn print_summary(cli: &Cli, results: &[TargetResult]) -> Result<()> {
    match cli.format {
        crate::OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(results)?);
        }
        crate::OutputFormat::Text => {
            let succeeded = results.iter().filter(|result| result.success).count();
            println!("{succeeded}/{} targets succeeded", results.len());
            for result in results {
                let status = if result.success { "ok" } else { "failed" };
                match &result.error {
                    Some(error) => println!(
                        "  {:<24} {status:<8} attempts={} fields={} ({error})",
                        result.target,
                        result.attempts,
                        result.fields.len()
                    ),
                    None => println!(
                        "  {:<24} {status:<8} attempts={} fields={}",
                        result.target,
                        result.attempts,
                        result.fields.len()
                    ),
                }
            }
        }
    }
    Ok(())
}

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use patrol_core::Orchestrator;
use tokio_util::sync::CancellationToken;

use common::{harness, harness_with, target, MockDriver, SiteModel, StaticCredentials};

fn catalog_target() -> patrol_core::Target {
    target(
        r#"
        name = "books"
        base_url = "https://books.example.com"

        [[steps]]
        name = "open-catalog"
        kind = "navigate"
        url = "/catalog"

        [[steps]]
        name = "wait-list"
        kind = "wait_for"
        condition = { selector = ".ready" }

        [[steps]]
        name = "grab"
        kind = "extract"
        fields = [
            { name = "headline", selector = "h1", required = true },
            { name = "promo", selector = ".promo", required = false },
        ]
        "#,
    )
}

#[tokio::test(start_paused = true)]
async fn workflow_extracts_fields_and_reports_success() {
    let model = SiteModel::with_values(&[("h1", "Spring sale")]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let cancel = CancellationToken::new();

    let result = harness
        .executor
        .run_target(&catalog_target(), &cancel)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.fields.get("headline").map(String::as_str), Some("Spring sale"));
    assert!(
        !result.fields.contains_key("promo"),
        "optional absent field must be omitted, not empty"
    );
    assert_eq!(driver.opened.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_navigation_failure_retries_from_failed_step() {
    let model = SiteModel::with_values(&[("h1", "Spring sale")]);
    model.nav_failures.store(1, Ordering::SeqCst);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let cancel = CancellationToken::new();

    let result = harness
        .executor
        .run_target(&catalog_target(), &cancel)
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.attempts, 2);
    // The failed navigate ran twice, later steps only once.
    let actions = model.actions();
    let navigations = actions.iter().filter(|a| a.starts_with("navigate")).count();
    let waits = actions.iter().filter(|a| a.starts_with("wait_for")).count();
    assert_eq!(navigations, 2);
    assert_eq!(waits, 1);
}

#[tokio::test(start_paused = true)]
async fn missing_required_field_is_terminal_with_partial_fields() {
    // Two extract steps; the second one's required selector never resolves.
    let model = SiteModel::with_values(&[("h1", "First page")]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let cancel = CancellationToken::new();

    let two_step = target(
        r#"
        name = "books"
        base_url = "https://books.example.com"

        [[steps]]
        name = "front-page"
        kind = "extract"
        fields = [{ name = "headline", selector = "h1", required = true }]

        [[steps]]
        name = "details"
        kind = "extract"
        fields = [{ name = "price", selector = ".price", required = true }]
        "#,
    );

    let result = harness.executor.run_target(&two_step, &cancel).await;

    assert!(!result.success);
    assert_eq!(result.attempts, 1, "missing required field must not retry");
    let error = result.error.expect("error expected");
    assert!(error.contains("required field 'price'"), "error: {error}");
    assert_eq!(result.fields.get("headline").map(String::as_str), Some("First page"));
    assert!(!result.fields.contains_key("price"));
}

#[tokio::test(start_paused = true)]
async fn open_circuit_fails_fast_without_consuming_a_session() {
    let model = SiteModel::with_values(&[]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let cancel = CancellationToken::new();

    let breaker = harness.breakers.breaker("books");
    for _ in 0..5 {
        breaker.record_failure();
    }

    let result = harness
        .executor
        .run_target(&catalog_target(), &cancel)
        .await;

    assert!(!result.success);
    assert!(result.error.unwrap().contains("circuit open"));
    assert_eq!(
        driver.opened.load(Ordering::SeqCst),
        0,
        "denied circuit must not touch the pool"
    );
}

#[tokio::test(start_paused = true)]
async fn login_runs_before_first_step_and_missing_credentials_are_terminal() {
    let login_target = target(
        r##"
        name = "portal"
        base_url = "https://portal.example.com"

        [login]
        url = "/login"
        username_selector = "#user"
        password_selector = "#pass"
        submit_selector = "#submit"
        username_key = "USERNAME"
        password_key = "PASSWORD"
        wait_for = { selector = "#account" }

        [[steps]]
        name = "grab"
        kind = "extract"
        fields = [{ name = "total", selector = ".total", required = true }]
        "##,
    );

    let model = SiteModel::with_values(&[(".total", "42")]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let cancel = CancellationToken::new();

    let result = harness.executor.run_target(&login_target, &cancel).await;
    assert!(result.success, "error: {:?}", result.error);
    let actions = model.actions();
    let login_pos = actions
        .iter()
        .position(|a| a == "navigate https://portal.example.com/login")
        .expect("login navigation recorded");
    let extract_pos = actions
        .iter()
        .position(|a| a == "extract .total")
        .expect("extract recorded");
    assert!(login_pos < extract_pos, "login must precede the workflow");
    assert!(actions.contains(&"fill #user".to_string()));
    assert!(actions.contains(&"click #submit".to_string()));

    // Same target without resolvable credentials fails terminally.
    let model = SiteModel::with_values(&[(".total", "42")]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = common::harness(Arc::clone(&driver), Arc::new(common::EmptyCredentials));
    let result = harness.executor.run_target(&login_target, &cancel).await;
    assert!(!result.success);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("credential"));
}

#[tokio::test(start_paused = true)]
async fn orchestrator_produces_one_result_per_target() {
    let model = SiteModel::with_values(&[("h1", "ok")]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness_with(Arc::clone(&driver), Arc::new(StaticCredentials), 1, 3);
    let orchestrator = Orchestrator::new(Arc::clone(&harness.executor), 2);
    let cancel = CancellationToken::new();

    let targets: Vec<_> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| {
            target(&format!(
                r#"
                name = "{name}"
                base_url = "https://{name}.example.com"

                [[steps]]
                name = "grab"
                kind = "extract"
                fields = [{{ name = "headline", selector = "h1", required = true }}]
                "#
            ))
        })
        .collect();

    let results = orchestrator.run(targets, &cancel).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|result| result.success));
    // One pooled session served every target.
    assert_eq!(driver.opened.load(Ordering::SeqCst), 1);
    assert_eq!(harness.pool.live_sessions(), 1);

    harness.pool.close(Duration::from_secs(1)).await;
    assert_eq!(harness.pool.live_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_run_still_reports_every_target() {
    let model = SiteModel::with_values(&[("h1", "ok")]);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let orchestrator = Orchestrator::new(Arc::clone(&harness.executor), 2);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let results = orchestrator
        .run(vec![catalog_target(), catalog_target()], &cancel)
        .await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| !result.success));
    assert!(results
        .iter()
        .all(|result| result.error.as_deref() == Some("cancelled")));
    assert_eq!(driver.opened.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_retry_backoff() {
    let model = SiteModel::with_values(&[("h1", "ok")]);
    // Every navigation fails, so the run sits in backoff between attempts.
    model.nav_failures.store(usize::MAX, Ordering::SeqCst);
    let driver = MockDriver::new(Arc::clone(&model));
    let harness = harness(Arc::clone(&driver), Arc::new(StaticCredentials));
    let executor = Arc::clone(&harness.executor);
    let cancel = CancellationToken::new();

    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { executor.run_target(&catalog_target(), &cancel).await })
    };
    tokio::time::advance(Duration::from_millis(20)).await;
    cancel.cancel();
    let result = run.await.unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("cancelled"));
}

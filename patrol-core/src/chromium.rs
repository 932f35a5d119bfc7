use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::{CloseParams, NavigateParams};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::ChromiumSection;
use crate::driver::{DriverError, DriverResult, PageSession, SessionDriver};
use crate::target::WaitCondition;

/// How often `wait_for` re-checks its condition.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Chromium-backed implementation of the driver traits. One browser
/// process hosts all pooled sessions; each session is a page.
pub struct ChromiumDriver {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<ChromiumSection>,
}

impl std::fmt::Debug for ChromiumDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChromiumDriver")
            .field("config", &self.config)
            .finish()
    }
}

impl ChromiumDriver {
    pub async fn launch(section: ChromiumSection) -> DriverResult<Self> {
        let config = build_browser_config(&section)?;
        info!(
            headless = section.headless,
            executable = section.executable_path.as_deref().unwrap_or("default"),
            "launching chromium"
        );
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(Self {
            browser,
            handler_task: Some(handler_task),
            config: Arc::new(section),
        })
    }

    pub async fn shutdown(mut self) -> DriverResult<()> {
        info!("shutting down chromium");
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "browser did not close gracefully");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for ChromiumDriver {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("ChromiumDriver dropped without explicit shutdown");
            }
        }
    }
}

#[async_trait]
impl SessionDriver for ChromiumDriver {
    async fn open(&self) -> DriverResult<Box<dyn PageSession>> {
        let params = CreateTargetParams::new("about:blank");
        let page = self
            .browser
            .new_page(params)
            .await
            .map_err(|err| map_cdp(err, "new page"))?;

        if let Some(user_agent) = &self.config.user_agent {
            let params = SetUserAgentOverrideParams::builder()
                .user_agent(user_agent.clone())
                .build()
                .map_err(DriverError::Protocol)?;
            page.set_user_agent(params)
                .await
                .map_err(|err| map_cdp(err, "set user agent"))?;
        }

        Ok(Box::new(ChromiumPage { page }))
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn navigate(&self, url: &str) -> DriverResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(DriverError::Protocol)?;
        self.page
            .goto(params)
            .await
            .map_err(|err| map_cdp(err, "navigate"))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|err| map_cdp(err, "navigation settle"))?;
        Ok(())
    }

    async fn wait_for(&self, condition: &WaitCondition, timeout: Duration) -> DriverResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let satisfied = match condition {
                WaitCondition::Selector { selector } => {
                    self.page.find_element(selector.clone()).await.is_ok()
                }
                WaitCondition::UrlContains { url_contains } => self
                    .page
                    .url()
                    .await
                    .map_err(|err| map_cdp(err, "read url"))?
                    .map(|url| url.contains(url_contains.as_str()))
                    .unwrap_or(false),
            };
            if satisfied {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(condition.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    async fn extract(
        &self,
        selector: &str,
        attribute: Option<&str>,
    ) -> DriverResult<Option<String>> {
        let element = match self.page.find_element(selector.to_string()).await {
            Ok(element) => element,
            Err(_) => return Ok(None),
        };
        let value = match attribute {
            Some(attribute) => element
                .attribute(attribute.to_string())
                .await
                .map_err(|err| map_cdp(err, "read attribute"))?,
            None => element
                .inner_text()
                .await
                .map_err(|err| map_cdp(err, "read text"))?,
        };
        Ok(Some(value.unwrap_or_default()))
    }

    async fn fill(&self, selector: &str, value: &str) -> DriverResult<()> {
        let element = self
            .page
            .find_element(selector.to_string())
            .await
            .map_err(|_| DriverError::NotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|err| map_cdp(err, "focus field"))?;
        element
            .type_str(value)
            .await
            .map_err(|err| map_cdp(err, "type into field"))?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> DriverResult<()> {
        let element = self
            .page
            .find_element(selector.to_string())
            .await
            .map_err(|_| DriverError::NotFound(selector.to_string()))?;
        element
            .click()
            .await
            .map_err(|err| map_cdp(err, "click"))?;
        Ok(())
    }

    async fn current_url(&self) -> DriverResult<String> {
        Ok(self
            .page
            .url()
            .await
            .map_err(|err| map_cdp(err, "read url"))?
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn page_source(&self) -> DriverResult<String> {
        self.page
            .content()
            .await
            .map_err(|err| map_cdp(err, "read page source"))
    }

    async fn close(&self) -> DriverResult<()> {
        self.page
            .execute(CloseParams::default())
            .await
            .map_err(|err| map_cdp(err, "close page"))?;
        Ok(())
    }
}

fn build_browser_config(section: &ChromiumSection) -> DriverResult<BrowserConfig> {
    let mut builder = BrowserConfig::builder();
    if let Some(path) = &section.executable_path {
        builder = builder.chrome_executable(path);
    }
    if !section.headless {
        builder = builder.with_head();
    }
    if !section.sandbox {
        builder = builder.no_sandbox();
    }
    if let Some(timeout_ms) = section.request_timeout_ms {
        builder = builder.request_timeout(Duration::from_millis(timeout_ms));
    }

    let mut args = Vec::new();
    if section.disable_gpu {
        args.push("--disable-gpu".to_string());
    }
    args.push("--disable-background-timer-throttling".to_string());
    args.extend(section.extra_args.iter().cloned());
    builder = builder.args(args);

    builder.build().map_err(DriverError::Launch)
}

/// Maps transport-level CDP failures onto the driver taxonomy. The error
/// text is the most reliable discriminator the crate exposes.
fn map_cdp(err: CdpError, what: &str) -> DriverError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("timeout") {
        DriverError::Timeout(format!("{what}: {text}"))
    } else if lowered.contains("ws")
        || lowered.contains("channel")
        || lowered.contains("connection")
        || lowered.contains("io error")
    {
        DriverError::ConnectionLost(format!("{what}: {text}"))
    } else {
        DriverError::Protocol(format!("{what}: {text}"))
    }
}

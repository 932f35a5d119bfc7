use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::driver::PageSession;
use crate::engine::EngineError;

/// Hook invoked when a step or workflow fails, before the session is
/// released. The executor awaits it under a short grace timeout, so a slow
/// implementation delays nothing but its own snapshot.
#[async_trait]
pub trait FailureProbe: Send + Sync {
    async fn on_failure(
        &self,
        target: &str,
        step: &str,
        page: &dyn PageSession,
        error: &EngineError,
    );
}

/// Probe that does nothing; the engine is correct without artifact capture.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProbe;

#[async_trait]
impl FailureProbe for NoopProbe {
    async fn on_failure(
        &self,
        _target: &str,
        _step: &str,
        _page: &dyn PageSession,
        _error: &EngineError,
    ) {
    }
}

/// Persists the failing page's markup and URL to an artifacts directory,
/// one file per failure, named `<target>_<step>_<timestamp>.html`.
#[derive(Debug, Clone)]
pub struct HtmlSnapshotProbe {
    dir: PathBuf,
}

impl HtmlSnapshotProbe {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self, target: &str, step: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        self.dir
            .join(format!("{}_{}_{stamp}.html", sanitize(target), sanitize(step)))
    }
}

#[async_trait]
impl FailureProbe for HtmlSnapshotProbe {
    async fn on_failure(
        &self,
        target: &str,
        step: &str,
        page: &dyn PageSession,
        error: &EngineError,
    ) {
        let markup = match page.page_source().await {
            Ok(markup) => markup,
            Err(err) => {
                debug!(error = %err, "page source unavailable for failure snapshot");
                return;
            }
        };
        let url = page.current_url().await.unwrap_or_default();
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            warn!(error = %err, "cannot create artifacts directory");
            return;
        }
        let path = self.snapshot_path(target, step);
        let banner = format!("<!-- url: {url}\n     error: {error} -->\n");
        if let Err(err) = std::fs::write(&path, banner + &markup) {
            warn!(error = %err, path = %path.display(), "failed to write failure snapshot");
        } else {
            debug!(path = %path.display(), "failure snapshot written");
        }
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

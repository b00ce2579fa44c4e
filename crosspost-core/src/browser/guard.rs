use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::metrics::PipelineMetrics;

use super::error::BrowserResult;
use super::session::{PageSession, SessionProvider};

/// Owns one tab for the duration of a task attempt. `close` is the normal
/// exit; dropping an unclosed guard schedules the close on the runtime.
pub struct PageGuard {
    page: Arc<dyn PageSession>,
    metrics: Arc<PipelineMetrics>,
    label: String,
    closed: bool,
}

impl PageGuard {
    pub async fn open(
        provider: &dyn SessionProvider,
        url: &str,
        metrics: Arc<PipelineMetrics>,
        label: impl Into<String>,
    ) -> BrowserResult<Self> {
        let page = provider.open_page(url).await?;
        Ok(Self::new(Arc::from(page), metrics, label))
    }

    pub fn new(
        page: Arc<dyn PageSession>,
        metrics: Arc<PipelineMetrics>,
        label: impl Into<String>,
    ) -> Self {
        metrics.record_page_opened();
        Self {
            page,
            metrics,
            label: label.into(),
            closed: false,
        }
    }

    pub fn page(&self) -> &dyn PageSession {
        self.page.as_ref()
    }

    pub async fn close(mut self) -> BrowserResult<()> {
        self.closed = true;
        self.metrics.record_page_closed();
        debug!(target: "browser.page", label = %self.label, "closing page");
        self.page.close().await
    }
}

/// Passes `setup` through, closing `page` first when it failed. Used between
/// creating a tab and handing it to a [`PageGuard`].
pub async fn close_on_setup_error(
    page: &dyn PageSession,
    setup: BrowserResult<()>,
) -> BrowserResult<()> {
    if let Err(err) = setup {
        warn!(target: "browser.page", error = %err, "page setup failed, closing tab");
        if let Err(close_err) = page.close().await {
            warn!(target: "browser.page", error = %close_err, "failed to close tab after setup error");
        }
        return Err(err);
    }
    Ok(())
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.metrics.record_page_leaked();
        warn!(target: "browser.page", label = %self.label, "page dropped without close");
        let page = Arc::clone(&self.page);
        let metrics = Arc::clone(&self.metrics);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = page.close().await {
                        warn!(target: "browser.page", error = %err, "deferred close failed");
                    }
                    metrics.record_page_closed();
                });
            }
            Err(_) => warn!(target: "browser.page", "no runtime available to close page"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::error::BrowserError;
    use crate::browser::scripted::{PageScript, ScriptedSessionProvider};

    #[tokio::test]
    async fn close_marks_page_closed() {
        let provider = ScriptedSessionProvider::new(PageScript::default());
        let metrics = Arc::new(PipelineMetrics::new());
        let guard = PageGuard::open(&provider, "about:blank", metrics.clone(), "t")
            .await
            .unwrap();
        guard.close().await.unwrap();
        assert!(provider.pages()[0].is_closed());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.open_pages(), 0);
        assert_eq!(snapshot.pages_leaked, 0);
    }

    #[tokio::test]
    async fn failed_setup_closes_the_tab() {
        let provider = ScriptedSessionProvider::new(PageScript::default().fail_setup());
        let err = match provider.open_page("https://dev.to/new").await {
            Ok(_) => panic!("setup should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, BrowserError::Script(_)));
        assert_eq!(provider.pages_opened(), 1);
        assert!(provider.pages()[0].is_closed());
    }

    #[tokio::test]
    async fn successful_setup_leaves_the_tab_open() {
        let provider = ScriptedSessionProvider::new(PageScript::default());
        let page = provider.open_page("about:blank").await.unwrap();
        close_on_setup_error(page.as_ref(), Ok(())).await.unwrap();
        assert!(!provider.pages()[0].is_closed());
    }

    #[tokio::test]
    async fn dropped_guard_still_closes() {
        let provider = ScriptedSessionProvider::new(PageScript::default());
        let metrics = Arc::new(PipelineMetrics::new());
        {
            let _guard = PageGuard::open(&provider, "about:blank", metrics.clone(), "t")
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(provider.pages()[0].is_closed());
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pages_leaked, 1);
        assert_eq!(snapshot.open_pages(), 0);
    }
}

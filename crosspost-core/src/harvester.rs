use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{
    wait_until, BrowserError, PageGuard, PageSession, PollSpec, SessionProvider, WaitOutcome,
};
use crate::credentials::{CredentialError, CredentialStore, PlatformCredential};
use crate::driver::PlatformProfile;
use crate::metrics::PipelineMetrics;
use crate::platform::Platform;

const LOGIN_TIMEOUT: Duration = Duration::from_secs(180);
const LOGIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{0} has no sign-in page configured")]
    NoLoginPage(Platform),
    #[error("login not completed within {0:?}")]
    Timeout(Duration),
    #[error("browser window closed before login finished: {0}")]
    WindowClosed(BrowserError),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
}

pub type HarvestResult<T> = Result<T, HarvestError>;

/// Waits for a human to sign in through a visible browser and stores the
/// session cookies it ends up with.
pub struct CredentialHarvester {
    sessions: Arc<dyn SessionProvider>,
    store: Arc<dyn CredentialStore>,
    metrics: Arc<PipelineMetrics>,
    poll: PollSpec,
}

impl CredentialHarvester {
    /// `sessions` should hand out visible pages.
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        store: Arc<dyn CredentialStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            sessions,
            store,
            metrics,
            poll: PollSpec::from_timeout(LOGIN_TIMEOUT, LOGIN_POLL_INTERVAL),
        }
    }

    pub fn with_poll(mut self, poll: PollSpec) -> Self {
        self.poll = poll;
        self
    }

    pub async fn harvest(&self, user_id: i64, platform: Platform) -> HarvestResult<PlatformCredential> {
        let profile = PlatformProfile::for_platform(platform);
        let login_url = profile
            .login_urls
            .first()
            .cloned()
            .ok_or(HarvestError::NoLoginPage(platform))?;

        let guard = PageGuard::open(
            self.sessions.as_ref(),
            &login_url,
            Arc::clone(&self.metrics),
            format!("login-{platform}"),
        )
        .await?;
        info!(target: "harvester", user_id, %platform, url = %login_url, "waiting for interactive login");
        let outcome = self.wait_for_session(guard.page(), &profile).await;
        if let Err(err) = guard.close().await {
            debug!(target: "harvester", error = %err, "closing login page failed");
        }

        let credential = match outcome {
            WaitOutcome::Succeeded(credential) => credential,
            WaitOutcome::TimedOut => return Err(HarvestError::Timeout(self.poll.budget())),
            WaitOutcome::Errored(err) => return Err(HarvestError::WindowClosed(err)),
        };
        self.store
            .save_credentials(user_id, platform, &credential.to_map())
            .await?;
        info!(target: "harvester", user_id, %platform, "session captured");
        Ok(credential)
    }

    async fn wait_for_session(
        &self,
        page: &dyn PageSession,
        profile: &PlatformProfile,
    ) -> WaitOutcome<PlatformCredential, BrowserError> {
        wait_until(self.poll, |_| async move {
            let url = page.current_url().await?;
            if profile.is_login_url(&url) {
                return Ok(None);
            }
            match page.cookies().await {
                Ok(cookies) => Ok(PlatformCredential::from_cookies(profile.platform, &cookies)),
                Err(err) if err.is_crash() => Err(err),
                Err(err) => {
                    warn!(target: "harvester", error = %err, "cookie read failed");
                    Ok(None)
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::scripted::{PageScript, ScriptedSessionProvider};
    use crate::browser::SessionCookie;
    use crate::credentials::SqliteCredentialStore;
    use tempfile::tempdir;

    #[tokio::test(start_paused = true)]
    async fn saves_cookies_once_they_appear() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteCredentialStore::open(dir.path().join("creds.sqlite")).unwrap());
        let script = PageScript::default()
            .with_redirect("https://dev.to/enter", "https://dev.to/")
            .with_cookies(
                vec![SessionCookie::new("remember_user_token", "tok", "dev.to")],
                2,
            );
        let provider = Arc::new(ScriptedSessionProvider::new(script));
        let harvester = CredentialHarvester::new(
            provider.clone(),
            store.clone(),
            Arc::new(PipelineMetrics::new()),
        );

        let credential = harvester.harvest(3, Platform::DevTo).await.unwrap();
        assert_eq!(credential, PlatformCredential::DevTo { token: "tok".into() });
        let saved = store.get_credentials(3, Platform::DevTo).await.unwrap().unwrap();
        assert_eq!(saved.values.get("remember_user_token").map(String::as_str), Some("tok"));
        assert!(provider.pages()[0].is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_poll_budget() {
        let dir = tempdir().unwrap();
        let store = Arc::new(SqliteCredentialStore::open(dir.path().join("creds.sqlite")).unwrap());
        let provider = Arc::new(ScriptedSessionProvider::new(PageScript::default()));
        let harvester = CredentialHarvester::new(provider, store, Arc::new(PipelineMetrics::new()))
            .with_poll(PollSpec::new(3, Duration::from_secs(2)));

        let err = harvester.harvest(3, Platform::Medium).await.unwrap_err();
        assert!(matches!(err, HarvestError::Timeout(_)));
    }
}

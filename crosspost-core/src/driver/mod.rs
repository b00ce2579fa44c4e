//! Generic publish state machine. Each platform only contributes a
//! [`PlatformProfile`]; the ordering of states, the bounded waits and the
//! failure classification are shared.

mod profile;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::browser::{
    wait_until, BrowserError, BrowserResult, HumanSimulator, Key, Locator, PageGuard,
    PageSession, PollSpec, SessionCookie, SessionProvider, WaitOutcome, BLANK_PAGE,
};
use crate::config::{CrosspostConfig, HumanSection};
use crate::failure::{PublishError, PublishResult};
use crate::metrics::PipelineMetrics;
use crate::platform::Platform;

pub use profile::{
    Confirmation, CoverUpload, EntryMode, FieldSpec, LinkAppend, MetadataSpec, PlatformProfile,
    PublishConfirmation, SaveIndicator, SessionCookieSpec, TagGesture,
};
pub use state::PublishState;

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const EDITOR_POLL_INTERVAL: Duration = Duration::from_millis(500);
const COMPOSER_OPEN_PAUSE_MS: [u32; 2] = [2000, 3000];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub cover_file: Option<PathBuf>,
    pub blog_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub url: Option<String>,
    pub states: Vec<PublishState>,
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub sync_poll: PollSpec,
    pub publish_attempts: u32,
    pub editor_timeout: Duration,
    pub element_timeout: Duration,
    pub capture_dir: PathBuf,
    pub human: HumanSection,
    /// Fixed simulator seed; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl DriverSettings {
    pub fn from_config(config: &CrosspostConfig) -> Self {
        let driver = &config.driver;
        Self {
            sync_poll: PollSpec::new(
                driver.sync_attempts,
                Duration::from_millis(driver.sync_interval_ms),
            ),
            publish_attempts: driver.publish_attempts,
            editor_timeout: Duration::from_secs(driver.editor_timeout_seconds),
            element_timeout: Duration::from_secs(driver.element_timeout_seconds),
            capture_dir: PathBuf::from(&driver.capture_dir),
            human: config.human.clone(),
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&CrosspostConfig::default())
    }
}

/// Runs one publish attempt per call, each on its own page.
pub struct PublishDriver {
    sessions: Arc<dyn SessionProvider>,
    settings: DriverSettings,
    metrics: Arc<PipelineMetrics>,
}

impl PublishDriver {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        settings: DriverSettings,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            sessions,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub async fn publish(
        &self,
        platform: Platform,
        cookies: &[SessionCookie],
        request: &PublishRequest,
    ) -> PublishResult<PublishReceipt> {
        let profile = PlatformProfile::for_platform(platform);
        let guard = match PageGuard::open(
            self.sessions.as_ref(),
            BLANK_PAGE,
            Arc::clone(&self.metrics),
            platform.as_str(),
        )
        .await
        {
            Ok(guard) => guard,
            Err(source) => {
                if source.is_crash() || matches!(source, BrowserError::Launch(_)) {
                    self.sessions.invalidate().await;
                }
                return Err(PublishError::BrowserCrashed {
                    state: PublishState::Init,
                    source,
                });
            }
        };

        let human = match self.settings.seed {
            Some(seed) => HumanSimulator::with_seed(self.settings.human.clone(), seed),
            None => HumanSimulator::new(self.settings.human.clone()),
        };
        let mut attempt = Attempt {
            page: guard.page(),
            profile: &profile,
            settings: &self.settings,
            human,
            states: vec![PublishState::Init],
        };
        let outcome = attempt.run(cookies, request).await;
        let states = std::mem::take(&mut attempt.states);

        if let Err(err) = guard.close().await {
            debug!(target: "driver", %platform, error = %err, "page close failed");
        }

        let url = outcome?;
        Ok(PublishReceipt { url, states })
    }
}

/// What a confirmation poll saw.
enum Signal<T> {
    Accepted(T),
    Rejected(String),
}

struct Attempt<'a> {
    page: &'a dyn PageSession,
    profile: &'a PlatformProfile,
    settings: &'a DriverSettings,
    human: HumanSimulator,
    states: Vec<PublishState>,
}

impl<'a> Attempt<'a> {
    fn state(&self) -> PublishState {
        self.states.last().copied().unwrap_or(PublishState::Init)
    }

    fn advance(&mut self, next: PublishState) {
        info!(
            target: "driver",
            platform = %self.profile.platform,
            state = %next,
            "publish state reached"
        );
        self.states.push(next);
    }

    async fn run(
        &mut self,
        cookies: &[SessionCookie],
        request: &PublishRequest,
    ) -> PublishResult<Option<String>> {
        if let Err(err) = self.page.set_cookies(cookies).await {
            return Err(self.fail(err).await);
        }
        self.advance(PublishState::SessionInjected);

        self.open_editor().await?;
        self.advance(PublishState::EditorReady);

        match self.profile.title.clone() {
            Some(field) => {
                self.enter_field(&field, &request.title).await?;
                self.advance(PublishState::TitleEntered);
                self.confirm(&field).await?;
                if field.trailing_enter {
                    let pressed = self.page.press_key(Key::Enter).await;
                    self.check(pressed).await?;
                }
                self.advance(PublishState::TitleConfirmed);
            }
            None => {
                self.advance(PublishState::TitleEntered);
                self.advance(PublishState::TitleConfirmed);
            }
        }

        if let (Some(cover), Some(file)) = (self.profile.cover.clone(), request.cover_file.clone()) {
            match self.upload_cover(&cover, &file).await {
                Ok(()) => debug!(target: "driver", file = %file.display(), "cover uploaded"),
                Err(err) if err.is_crash() => return Err(self.fail(err).await),
                Err(err) => warn!(
                    target: "driver",
                    platform = %self.profile.platform,
                    error = %err,
                    "cover upload failed; continuing without it"
                ),
            }
        }

        let body = self.profile.body.clone();
        self.enter_field(&body, &request.content).await?;
        if let (Some(link), Some(url)) = (self.profile.link.clone(), request.blog_url.as_deref()) {
            self.append_link(&link, url).await?;
        }
        self.advance(PublishState::BodyEntered);
        self.confirm(&body).await?;
        self.advance(PublishState::BodyConfirmed);

        if let Some(metadata) = self.profile.metadata.clone() {
            self.apply_metadata(&metadata, &request.tags).await?;
        }
        self.advance(PublishState::MetadataApplied);

        let started_url = self.submit().await?;
        self.advance(PublishState::PublishRequested);

        let url = self.await_publication(&started_url).await?;
        self.advance(PublishState::PublishConfirmed);
        Ok(url)
    }

    async fn open_editor(&mut self) -> PublishResult<()> {
        let profile = self.profile;
        let navigated = self.page.goto(&profile.composer_url).await;
        self.check(navigated).await?;
        self.human.pause(profile.reading_pause_ms).await;
        self.check_login_redirect().await?;

        if !profile.open_composer.is_empty() {
            let trigger = self.require_any(&profile.open_composer).await?;
            self.click(&trigger).await?;
            self.human.pause(COMPOSER_OPEN_PAUSE_MS).await;
        }

        let page = self.page;
        let editor = &profile.editor_ready;
        let spec = PollSpec::from_timeout(self.settings.editor_timeout, EDITOR_POLL_INTERVAL);
        match wait_until(spec, move |_| async move {
            present(page, editor).await.map(|found| found.then_some(()))
        })
        .await
        {
            WaitOutcome::Succeeded(()) => Ok(()),
            WaitOutcome::Errored(err) => Err(self.fail(err).await),
            WaitOutcome::TimedOut => {
                self.check_login_redirect().await?;
                let capture = self.capture().await;
                Err(PublishError::WafBlock {
                    state: self.state(),
                    detail: format!("editor {editor} never appeared"),
                    capture,
                })
            }
        }
    }

    async fn check_login_redirect(&mut self) -> PublishResult<()> {
        let url = self.probe_url().await?;
        if self.profile.is_login_url(&url) {
            warn!(target: "driver", platform = %self.profile.platform, %url, "redirected to login");
            return Err(PublishError::SessionExpired { url });
        }
        Ok(())
    }

    async fn enter_field(&mut self, field: &FieldSpec, text: &str) -> PublishResult<()> {
        if let Some(target) = &field.target {
            self.require(target).await?;
        }
        match field.entry {
            EntryMode::HumanType => {
                if let Some(target) = &field.target {
                    self.click(target).await?;
                }
                let typed = self.human.type_text(self.page, text).await;
                self.check(typed).await
            }
            EntryMode::Fill => {
                let filled = match &field.target {
                    Some(target) => self.page.fill(target, text).await,
                    None => self.page.insert_text(text).await,
                };
                self.check(filled).await
            }
            EntryMode::ClipboardPaste => {
                if let Some(target) = &field.target {
                    self.click(target).await?;
                }
                match self.page.write_clipboard(text).await {
                    Ok(()) => {
                        let pasted = self.page.paste_shortcut().await;
                        self.check(pasted).await?;
                    }
                    Err(err) if err.is_crash() => return Err(self.fail(err).await),
                    Err(err) => {
                        debug!(target: "driver", error = %err, "clipboard unavailable; inserting directly");
                        let inserted = self.page.insert_text(text).await;
                        self.check(inserted).await?;
                    }
                }
                let nudged = self.human.nudge(self.page).await;
                self.check(nudged).await
            }
        }
    }

    async fn append_link(&mut self, link: &LinkAppend, url: &str) -> PublishResult<()> {
        self.human.pause(link.pause_ms).await;
        let page = self.page;
        let appended = async {
            page.press_key(Key::Enter).await?;
            page.press_key(Key::Enter).await?;
            page.insert_text(url).await
        }
        .await;
        self.check(appended).await?;
        sleep(link.preview_wait).await;
        Ok(())
    }

    async fn confirm(&mut self, field: &FieldSpec) -> PublishResult<()> {
        let profile = self.profile;
        let indicator = match (&field.confirm, &profile.save_indicator) {
            (Confirmation::SaveIndicator, Some(indicator)) => indicator,
            _ => return Ok(()),
        };
        let page = self.page;
        match wait_until(self.settings.sync_poll, move |_| async move {
            if present(page, &indicator.error).await? {
                let detail = page
                    .text_of(&indicator.error)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| indicator.error.to_string());
                return Ok(Some(Signal::Rejected(detail)));
            }
            let saved = present(page, &indicator.saved).await?;
            Ok::<_, BrowserError>(saved.then_some(Signal::Accepted(())))
        })
        .await
        {
            WaitOutcome::Succeeded(Signal::Accepted(())) => Ok(()),
            WaitOutcome::Succeeded(Signal::Rejected(detail)) => Err(self.blocked(detail).await),
            WaitOutcome::TimedOut => {
                warn!(
                    target: "driver",
                    platform = %self.profile.platform,
                    state = %self.state(),
                    attempts = self.settings.sync_poll.attempts,
                    "save indicator never appeared"
                );
                Err(PublishError::SyncTimeout {
                    state: self.state(),
                })
            }
            WaitOutcome::Errored(err) => Err(self.fail(err).await),
        }
    }

    async fn upload_cover(&mut self, cover: &CoverUpload, file: &std::path::Path) -> BrowserResult<()> {
        for candidates in &cover.steps {
            let target = first_present(self.page, candidates)
                .await?
                .cloned()
                .ok_or_else(|| BrowserError::ElementNotFound(describe(candidates)))?;
            self.human.click(self.page, &target).await?;
        }
        let input = first_present(self.page, &cover.file_inputs)
            .await?
            .cloned()
            .ok_or_else(|| BrowserError::ElementNotFound(describe(&cover.file_inputs)))?;
        self.page.upload_file(&input, file).await?;
        sleep(cover.settle).await;
        if cover.trailing_enter {
            self.page.press_key(Key::Enter).await?;
        }
        Ok(())
    }

    async fn apply_metadata(&mut self, metadata: &MetadataSpec, tags: &[String]) -> PublishResult<()> {
        let mut tags: Vec<String> = tags
            .iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .take(metadata.max_tags)
            .collect();
        if tags.is_empty() {
            if let Some(default) = &metadata.default_tag {
                tags.push(default.clone());
            }
        }
        if tags.is_empty() && !metadata.required {
            return Ok(());
        }

        if !metadata.panel_openers.is_empty() {
            match first_present(self.page, &metadata.panel_openers).await {
                Ok(Some(opener)) => {
                    let opener = opener.clone();
                    self.click(&opener).await?;
                }
                Ok(None) => debug!(target: "driver", "no metadata panel opener present"),
                Err(err) => return Err(self.fail(err).await),
            }
        }
        if let Some(panel) = &metadata.panel {
            let page = self.page;
            let spec = PollSpec::from_timeout(self.settings.editor_timeout, EDITOR_POLL_INTERVAL);
            match wait_until(spec, move |_| async move {
                present(page, panel).await.map(|found| found.then_some(()))
            })
            .await
            {
                WaitOutcome::Succeeded(()) => {}
                WaitOutcome::TimedOut => {
                    warn!(target: "driver", %panel, "metadata panel did not open")
                }
                WaitOutcome::Errored(err) => return Err(self.fail(err).await),
            }
        }

        let input = match self.wait_any(&metadata.tag_inputs).await {
            Ok(Some(input)) => input,
            Ok(None) if metadata.required => {
                let capture = self.capture().await;
                return Err(PublishError::UnexpectedPage {
                    state: self.state(),
                    detail: format!("tag input {} missing", describe(&metadata.tag_inputs)),
                    capture,
                });
            }
            Ok(None) => {
                warn!(target: "driver", platform = %self.profile.platform, "tag input missing; publishing without tags");
                return Ok(());
            }
            Err(err) => return Err(self.fail(err).await),
        };

        let applied = match metadata.gesture {
            TagGesture::Enter => self.tags_with_enter(&input, &tags).await,
            TagGesture::Blur => {
                let joined = tags.join(", ");
                match self.page.fill(&input, &joined).await {
                    Ok(()) => self.page.blur(&input).await,
                    Err(err) => Err(err),
                }
            }
        };
        match applied {
            Ok(()) => Ok(()),
            Err(err) if err.is_crash() || metadata.required => Err(self.fail(err).await),
            Err(err) => {
                warn!(target: "driver", error = %err, "tags not applied");
                Ok(())
            }
        }
    }

    async fn tags_with_enter(&mut self, input: &Locator, tags: &[String]) -> BrowserResult<()> {
        self.human.click(self.page, input).await?;
        for tag in tags {
            self.human.type_text(self.page, tag).await?;
            self.page.press_key(Key::Enter).await?;
        }
        Ok(())
    }

    /// Clicks the submit control; returns the URL the page had at that moment.
    async fn submit(&mut self) -> PublishResult<String> {
        let profile = self.profile;
        let button = self.require_any(&profile.submit).await?;
        if profile.submit_must_be_enabled {
            let disabled = self.page.is_disabled(&button).await;
            let disabled = self.check(disabled).await?;
            if disabled {
                let capture = self.capture().await;
                return Err(PublishError::UnexpectedPage {
                    state: self.state(),
                    detail: format!("submit control {button} is disabled"),
                    capture,
                });
            }
        }
        let started_url = self.probe_url().await?;
        self.click(&button).await?;
        Ok(started_url)
    }

    async fn await_publication(&mut self, started_url: &str) -> PublishResult<Option<String>> {
        let page = self.page;
        let profile = self.profile;
        let spec = PollSpec::new(self.settings.publish_attempts, profile.publish_interval);
        let outcome = match &profile.publish {
            PublishConfirmation::NavigatedAway { success, error } => {
                wait_until(spec, move |_| async move {
                    if let Some(error) = error {
                        if present(page, error).await? {
                            let detail = page
                                .text_of(error)
                                .await
                                .ok()
                                .flatten()
                                .unwrap_or_else(|| error.to_string());
                            return Ok(Some(Signal::Rejected(detail)));
                        }
                    }
                    let url = page.current_url().await?;
                    if url != started_url {
                        return Ok(Some(Signal::Accepted(Some(url))));
                    }
                    if let Some(success) = success {
                        if present(page, success).await? {
                            return Ok(Some(Signal::Accepted(Some(url))));
                        }
                    }
                    Ok::<_, BrowserError>(None)
                })
                .await
            }
            PublishConfirmation::ModalClosed(modal) => {
                wait_until(spec, move |_| async move {
                    let open = present(page, modal).await?;
                    Ok::<_, BrowserError>((!open).then_some(Signal::Accepted(None)))
                })
                .await
            }
        };
        match outcome {
            WaitOutcome::Succeeded(Signal::Accepted(url)) => Ok(url),
            WaitOutcome::Succeeded(Signal::Rejected(detail)) => Err(self.blocked(detail).await),
            WaitOutcome::TimedOut => Err(PublishError::PublishTimeout {
                attempts: spec.attempts,
            }),
            WaitOutcome::Errored(err) => Err(self.fail(err).await),
        }
    }

    async fn click(&mut self, target: &Locator) -> PublishResult<()> {
        let page = self.page;
        match self.human.click(page, target).await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn require(&mut self, target: &Locator) -> PublishResult<()> {
        self.require_any(std::slice::from_ref(target)).await.map(|_| ())
    }

    async fn require_any(&mut self, candidates: &[Locator]) -> PublishResult<Locator> {
        match self.wait_any(candidates).await {
            Ok(Some(found)) => Ok(found),
            Ok(None) => Err(self.fail(BrowserError::ElementNotFound(describe(candidates))).await),
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn wait_any(&self, candidates: &[Locator]) -> BrowserResult<Option<Locator>> {
        let page = self.page;
        let spec = PollSpec::from_timeout(self.settings.element_timeout, ELEMENT_POLL_INTERVAL);
        match wait_until(spec, move |_| async move {
            first_present(page, candidates).await.map(|found| found.cloned())
        })
        .await
        {
            WaitOutcome::Succeeded(found) => Ok(Some(found)),
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Errored(err) => Err(err),
        }
    }

    async fn probe_url(&mut self) -> PublishResult<String> {
        match self.page.current_url().await {
            Ok(url) => Ok(url),
            Err(source) => Err(PublishError::BrowserCrashed {
                state: self.state(),
                source,
            }),
        }
    }

    async fn check<T>(&mut self, result: BrowserResult<T>) -> PublishResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail(err).await),
        }
    }

    async fn fail(&mut self, err: BrowserError) -> PublishError {
        let state = self.state();
        if err.is_crash() {
            warn!(target: "driver", platform = %self.profile.platform, %state, error = %err, "page unreachable");
            return PublishError::BrowserCrashed { state, source: err };
        }
        let capture = self.capture().await;
        PublishError::UnexpectedPage {
            state,
            detail: err.to_string(),
            capture,
        }
    }

    async fn blocked(&mut self, detail: String) -> PublishError {
        warn!(
            target: "driver",
            platform = %self.profile.platform,
            state = %self.state(),
            %detail,
            "platform rejected input"
        );
        let capture = self.capture().await;
        PublishError::WafBlock {
            state: self.state(),
            detail,
            capture,
        }
    }

    async fn capture(&mut self) -> Option<PathBuf> {
        let dir = &self.settings.capture_dir;
        if let Err(err) = tokio::fs::create_dir_all(dir).await {
            warn!(target: "driver", dir = %dir.display(), error = %err, "capture dir unavailable");
            return None;
        }
        let path = dir.join(format!(
            "{}-{}-{}.png",
            self.profile.platform,
            self.state(),
            Utc::now().format("%Y%m%dT%H%M%S%3f")
        ));
        match self.page.screenshot(&path).await {
            Ok(()) => Some(path),
            Err(err) => {
                warn!(target: "driver", error = %err, "screenshot failed");
                None
            }
        }
    }
}

/// Presence check that treats non-fatal DevTools errors as "not there yet".
async fn present(page: &dyn PageSession, locator: &Locator) -> BrowserResult<bool> {
    match page.exists(locator).await {
        Ok(found) => Ok(found),
        Err(err) if err.is_crash() => Err(err),
        Err(_) => Ok(false),
    }
}

async fn first_present<'l>(
    page: &dyn PageSession,
    candidates: &'l [Locator],
) -> BrowserResult<Option<&'l Locator>> {
    for candidate in candidates {
        if present(page, candidate).await? {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

fn describe(candidates: &[Locator]) -> String {
    candidates
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

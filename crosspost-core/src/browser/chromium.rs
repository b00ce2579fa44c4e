use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, CookieSameSite};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, NavigateParams};
use chromiumoxide::cdp::browser_protocol::target::CreateTargetParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::element::Element;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::layout::Point;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrowserSection;

use super::error::{BrowserError, BrowserResult};
use super::fingerprint::FingerprintMasker;
use super::guard::close_on_setup_error;
use super::session::{
    ElementBox, Key, Locator, PageSession, SessionCookie, SessionProvider, BLANK_PAGE,
};

const HANDLER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct SharedBrowser {
    browser: Browser,
    handler: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

impl SharedBrowser {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.handler.is_finished()
    }
}

/// Owns the one Chromium process shared by every worker in the process.
/// Launched on first use and relaunched on the next `open_page` after it dies.
pub struct BrowserSessionManager {
    section: BrowserSection,
    headless: bool,
    fingerprint: FingerprintMasker,
    slot: AsyncMutex<Option<Arc<SharedBrowser>>>,
}

impl BrowserSessionManager {
    pub fn new(section: BrowserSection) -> Self {
        let headless = section.resolve_headless();
        let fingerprint = FingerprintMasker::new(&section);
        Self {
            section,
            headless,
            fingerprint,
            slot: AsyncMutex::new(None),
        }
    }

    /// Forces a visible or headless window regardless of the environment.
    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn is_headless(&self) -> bool {
        self.headless
    }

    async fn shared(&self) -> BrowserResult<Arc<SharedBrowser>> {
        let mut slot = self.slot.lock().await;
        if let Some(shared) = slot.as_ref() {
            if shared.is_alive() {
                return Ok(Arc::clone(shared));
            }
            warn!(target: "browser", "shared browser died; relaunching");
        }
        let shared = Arc::new(self.launch().await?);
        *slot = Some(Arc::clone(&shared));
        Ok(shared)
    }

    async fn launch(&self) -> BrowserResult<SharedBrowser> {
        let config = build_chromium_config(&self.section, self.headless)?;
        info!(
            target: "browser",
            headless = self.headless,
            width = self.section.viewport[0],
            height = self.section.viewport[1],
            "launching Chromium"
        );
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let handler_alive = Arc::clone(&alive);
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(target: "browser", error = %err, "Chromium handler reported error");
                }
            }
            handler_alive.store(false, Ordering::SeqCst);
            warn!(target: "browser", "Chromium connection closed");
        });

        Ok(SharedBrowser {
            browser,
            handler,
            alive,
        })
    }

    /// Closes the shared browser. Pages still held elsewhere keep it alive
    /// until they are dropped.
    pub async fn shutdown(&self) {
        let shared = self.slot.lock().await.take();
        let Some(shared) = shared else {
            return;
        };
        match Arc::try_unwrap(shared) {
            Ok(mut shared) => {
                info!(target: "browser", "shutting down Chromium");
                if let Err(err) = shared.browser.close().await {
                    warn!(target: "browser", error = %err, "failed to close browser gracefully");
                }
                match timeout(HANDLER_JOIN_TIMEOUT, &mut shared.handler).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(target: "browser", error = %err, "browser handler join error"),
                    Err(_) => {
                        shared.handler.abort();
                        warn!(target: "browser", "browser handler did not stop in time");
                    }
                }
            }
            Err(_) => warn!(target: "browser", "browser still referenced at shutdown"),
        }
    }
}

#[async_trait]
impl SessionProvider for BrowserSessionManager {
    async fn open_page(&self, url: &str) -> BrowserResult<Box<dyn PageSession>> {
        let shared = self.shared().await?;
        let page = shared
            .browser
            .new_page(CreateTargetParams::new(BLANK_PAGE))
            .await?;
        let session = ChromiumPage { page };
        let setup = async {
            self.fingerprint.apply(&session.page).await?;
            if url != BLANK_PAGE {
                session.goto(url).await?;
            }
            Ok::<(), BrowserError>(())
        }
        .await;
        close_on_setup_error(&session, setup).await?;
        Ok(Box::new(session))
    }

    async fn invalidate(&self) {
        if self.slot.lock().await.take().is_some() {
            warn!(target: "browser", "shared browser invalidated");
        }
    }
}

pub(crate) fn launch_args(section: &BrowserSection) -> Vec<String> {
    let [width, height] = section.viewport;
    let mut args = vec![
        format!("--user-agent={}", section.user_agent),
        format!("--window-size={width},{height}"),
        "--no-first-run".to_string(),
        "--disable-features=AutomationControlled".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--password-store=basic".to_string(),
    ];
    if section.disable_gpu {
        args.push("--disable-gpu".into());
    }
    if let Some(lang) = &section.lang {
        args.push(format!("--lang={lang}"));
    }
    for feature in &section.disable_blink_features {
        args.push(format!("--disable-blink-features={feature}"));
    }
    args
}

fn build_chromium_config(section: &BrowserSection, headless: bool) -> BrowserResult<ChromiumConfig> {
    let [width, height] = section.viewport;
    let mut builder = ChromiumConfig::builder().viewport(ChromiumViewport {
        width,
        height,
        device_scale_factor: Some(1.0),
        emulating_mobile: false,
        is_landscape: width >= height,
        has_touch: false,
    });
    if let Some(path) = section.resolve_executable() {
        builder = builder.chrome_executable(path);
    }
    if let Some(dir) = &section.user_data_dir {
        builder = builder.user_data_dir(dir);
    }
    if !headless {
        builder = builder.with_head();
    }
    if !section.sandbox {
        builder = builder.no_sandbox();
    }
    if let Some(seconds) = section.request_timeout_seconds {
        builder = builder.request_timeout(Duration::from_secs(seconds));
    }
    builder
        .args(launch_args(section))
        .build()
        .map_err(BrowserError::Configuration)
}

/// A DevTools tab.
pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn find(&self, locator: &Locator) -> BrowserResult<Option<Element>> {
        let elements = self.page.find_elements(locator.css.as_str()).await?;
        let Some(text) = &locator.text else {
            return Ok(elements.into_iter().next());
        };
        for element in elements {
            let inner = element.inner_text().await?.unwrap_or_default();
            if inner.contains(text.as_str()) {
                return Ok(Some(element));
            }
        }
        Ok(None)
    }

    async fn require(&self, locator: &Locator) -> BrowserResult<Element> {
        self.find(locator)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(locator.to_string()))
    }

    async fn call(&self, locator: &Locator, function: String) -> BrowserResult<Value> {
        let element = self.require(locator).await?;
        let returns = element.call_js_fn(function, false).await?;
        Ok(returns.result.value.unwrap_or(Value::Null))
    }

    async fn dispatch_key(
        &self,
        key: &str,
        code: &str,
        text: Option<&str>,
        virtual_key: i64,
    ) -> BrowserResult<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let is_down = kind == DispatchKeyEventType::KeyDown;
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(kind)
                .key(key)
                .code(code)
                .windows_virtual_key_code(virtual_key);
            if let (Some(text), true) = (text, is_down) {
                builder = builder.text(text);
            }
            let params = builder.build().map_err(BrowserError::Configuration)?;
            self.page.execute(params).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl PageSession for ChromiumPage {
    async fn set_cookies(&self, cookies: &[SessionCookie]) -> BrowserResult<()> {
        let mut params = Vec::with_capacity(cookies.len());
        for cookie in cookies {
            let mut builder = CookieParam::builder()
                .name(cookie.name.clone())
                .value(cookie.value.clone())
                .domain(cookie.domain.clone())
                .path(cookie.path.clone())
                .secure(cookie.secure)
                .http_only(cookie.http_only);
            if cookie.same_site_lax {
                builder = builder.same_site(CookieSameSite::Lax);
            }
            params.push(builder.build().map_err(BrowserError::Configuration)?);
        }
        self.page.set_cookies(params).await?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.goto(params).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        match self.page.url().await {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(BrowserError::PageUnreachable("target has no url".into())),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, locator: &Locator) -> BrowserResult<bool> {
        Ok(self.find(locator).await?.is_some())
    }

    async fn text_of(&self, locator: &Locator) -> BrowserResult<Option<String>> {
        match self.find(locator).await? {
            Some(element) => Ok(element.inner_text().await?),
            None => Ok(None),
        }
    }

    async fn element_box(&self, locator: &Locator) -> BrowserResult<ElementBox> {
        let element = self.require(locator).await?;
        let bbox = element.bounding_box().await?;
        Ok(ElementBox {
            x: bbox.x,
            y: bbox.y,
            width: bbox.width,
            height: bbox.height,
        })
    }

    async fn scroll_into_view(&self, locator: &Locator) -> BrowserResult<()> {
        self.require(locator).await?.scroll_into_view().await?;
        Ok(())
    }

    async fn move_mouse(&self, x: f64, y: f64) -> BrowserResult<()> {
        self.page.move_mouse(Point { x, y }).await?;
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> BrowserResult<()> {
        self.require(locator).await?.click().await?;
        Ok(())
    }

    async fn focus(&self, locator: &Locator) -> BrowserResult<()> {
        self.require(locator).await?.focus().await?;
        Ok(())
    }

    async fn is_disabled(&self, locator: &Locator) -> BrowserResult<bool> {
        let value = self
            .call(
                locator,
                "function() { return this.disabled === true || this.getAttribute('aria-disabled') === 'true'; }"
                    .to_string(),
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn press_key(&self, key: Key) -> BrowserResult<()> {
        match key {
            Key::Enter => self.dispatch_key("Enter", "Enter", Some("\r"), 13).await,
            Key::Backspace => self.dispatch_key("Backspace", "Backspace", None, 8).await,
            Key::Char(ch) => {
                let text = ch.to_string();
                let code = if ch.is_ascii_alphabetic() {
                    format!("Key{}", ch.to_ascii_uppercase())
                } else if ch.is_ascii_digit() {
                    format!("Digit{ch}")
                } else if ch == ' ' {
                    "Space".to_string()
                } else {
                    String::new()
                };
                let virtual_key = if ch.is_ascii_alphanumeric() {
                    i64::from(ch.to_ascii_uppercase() as u8)
                } else if ch == ' ' {
                    32
                } else {
                    0
                };
                self.dispatch_key(&text, &code, Some(&text), virtual_key).await
            }
        }
    }

    async fn insert_text(&self, text: &str) -> BrowserResult<()> {
        self.page.execute(InsertTextParams::new(text)).await?;
        Ok(())
    }

    async fn write_clipboard(&self, text: &str) -> BrowserResult<()> {
        let literal = serde_json::to_string(text)
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        let params = EvaluateParams::builder()
            .expression(format!(
                "navigator.clipboard.writeText({literal}).then(() => true, () => false)"
            ))
            .await_promise(true)
            .return_by_value(true)
            .user_gesture(true)
            .build()
            .map_err(BrowserError::Configuration)?;
        let result = self.page.evaluate_expression(params).await?;
        match result.value().and_then(Value::as_bool) {
            Some(true) => Ok(()),
            _ => Err(BrowserError::Script("clipboard write rejected".into())),
        }
    }

    async fn paste_shortcut(&self) -> BrowserResult<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(kind.clone())
                .key("v")
                .code("KeyV")
                .windows_virtual_key_code(86)
                .modifiers(2);
            if kind == DispatchKeyEventType::KeyDown {
                builder = builder.commands(vec!["paste".to_string()]);
            }
            let params = builder.build().map_err(BrowserError::Configuration)?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    async fn fill(&self, locator: &Locator, text: &str) -> BrowserResult<()> {
        let literal = serde_json::to_string(text)
            .map_err(|err| BrowserError::Script(err.to_string()))?;
        let function = format!(
            r#"function() {{
                this.focus();
                const proto = Object.getPrototypeOf(this);
                const descriptor = Object.getOwnPropertyDescriptor(proto, 'value');
                if (descriptor && descriptor.set) {{
                    descriptor.set.call(this, {literal});
                }} else {{
                    this.value = {literal};
                }}
                this.dispatchEvent(new Event('input', {{ bubbles: true }}));
                this.dispatchEvent(new Event('change', {{ bubbles: true }}));
            }}"#
        );
        self.call(locator, function).await?;
        Ok(())
    }

    async fn blur(&self, locator: &Locator) -> BrowserResult<()> {
        self.call(locator, "function() { this.blur(); }".to_string())
            .await?;
        Ok(())
    }

    async fn upload_file(&self, locator: &Locator, path: &Path) -> BrowserResult<()> {
        let element = self.require(locator).await?;
        let params = SetFileInputFilesParams::builder()
            .files(vec![path.display().to_string()])
            .object_id(element.remote_object_id.clone())
            .build()
            .map_err(BrowserError::Configuration)?;
        self.page.execute(params).await?;
        Ok(())
    }

    async fn evaluate_json(&self, script: &str) -> BrowserResult<Value> {
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::Configuration)?;
        let result = self.page.evaluate_expression(params).await?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn cookies(&self) -> BrowserResult<Vec<SessionCookie>> {
        let cookies = self.page.get_cookies().await?;
        Ok(cookies
            .into_iter()
            .map(|cookie| SessionCookie {
                same_site_lax: matches!(cookie.same_site, Some(CookieSameSite::Lax)),
                name: cookie.name,
                value: cookie.value,
                domain: cookie.domain,
                path: cookie.path,
                secure: cookie.secure,
                http_only: cookie.http_only,
            })
            .collect())
    }

    async fn screenshot(&self, path: &Path) -> BrowserResult<()> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page.save_screenshot(params, path).await?;
        Ok(())
    }

    async fn close(&self) -> BrowserResult<()> {
        self.page.clone().close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_args_hide_automation() {
        let section = BrowserSection::default();
        let args = launch_args(&section);
        assert!(args.iter().any(|arg| arg == "--disable-blink-features=AutomationControlled"));
        assert!(args.iter().any(|arg| arg.starts_with("--user-agent=Mozilla/5.0")));
        assert!(args.iter().any(|arg| arg == "--window-size=1920,1080"));
        assert!(args.iter().any(|arg| arg == "--lang=en-US"));
    }

    #[test]
    fn explicit_headless_override_sticks() {
        let section = BrowserSection {
            headless: Some(true),
            ..BrowserSection::default()
        };
        let manager = BrowserSessionManager::new(section).with_headless(false);
        assert!(!manager.is_headless());
    }
}

//! In-memory page and provider driven by a declarative script. Used by the
//! test suites and by dry runs that must not touch a real browser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use super::error::{BrowserError, BrowserResult};
use super::guard::close_on_setup_error;
use super::session::{
    ElementBox, Key, Locator, PageSession, SessionCookie, SessionProvider,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PageAction {
    SetCookies(Vec<SessionCookie>),
    Goto(String),
    ScrollIntoView(Locator),
    MouseMove { x: f64, y: f64 },
    Click(Locator),
    Focus(Locator),
    Key(Key),
    InsertText(String),
    Clipboard(String),
    Paste,
    Fill(Locator, String),
    Blur(Locator),
    Upload(Locator, PathBuf),
    Evaluate(String),
    Screenshot(PathBuf),
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Navigate(String),
    Show { css: String, text: String },
    Hide(String),
}

#[derive(Debug, Clone, PartialEq)]
struct ScriptElement {
    css: String,
    text: String,
    disabled: bool,
    value: String,
}

#[derive(Debug, Clone, Default)]
pub struct PageScript {
    elements: Vec<ScriptElement>,
    redirects: HashMap<String, String>,
    on_click: Vec<(Locator, Vec<Effect>)>,
    evaluate_result: Option<Value>,
    clipboard_denied: bool,
    crash_on_goto: bool,
    fail_setup: bool,
    cookies: Vec<SessionCookie>,
    cookies_after_probes: u32,
}

impl PageScript {
    pub fn with_element(mut self, css: impl Into<String>, text: impl Into<String>) -> Self {
        self.elements.push(ScriptElement {
            css: css.into(),
            text: text.into(),
            disabled: false,
            value: String::new(),
        });
        self
    }

    pub fn with_disabled_element(mut self, css: impl Into<String>, text: impl Into<String>) -> Self {
        self.elements.push(ScriptElement {
            css: css.into(),
            text: text.into(),
            disabled: true,
            value: String::new(),
        });
        self
    }

    /// Navigating to `from` lands on `to`.
    pub fn with_redirect(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.redirects.insert(from.into(), to.into());
        self
    }

    pub fn on_click(mut self, locator: Locator, effects: Vec<Effect>) -> Self {
        self.on_click.push((locator, effects));
        self
    }

    pub fn with_evaluate_result(mut self, value: Value) -> Self {
        self.evaluate_result = Some(value);
        self
    }

    pub fn deny_clipboard(mut self) -> Self {
        self.clipboard_denied = true;
        self
    }

    /// The tab dies right after the first navigation.
    pub fn crash_on_goto(mut self) -> Self {
        self.crash_on_goto = true;
        self
    }

    /// `open_page` creates the tab and then fails before handing it out.
    pub fn fail_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    /// Cookies become visible after `probes` calls to `cookies()`.
    pub fn with_cookies(mut self, cookies: Vec<SessionCookie>, probes: u32) -> Self {
        self.cookies = cookies;
        self.cookies_after_probes = probes;
        self
    }
}

#[derive(Debug)]
struct PageState {
    script: PageScript,
    url: String,
    actions: Vec<PageAction>,
    closed: bool,
    crashed: bool,
    cookie_probes: u32,
}

impl PageState {
    fn find(&self, locator: &Locator) -> Option<&ScriptElement> {
        self.script.elements.iter().find(|element| matches(element, locator))
    }

    fn find_mut(&mut self, locator: &Locator) -> Option<&mut ScriptElement> {
        self.script
            .elements
            .iter_mut()
            .find(|element| matches(element, locator))
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Navigate(url) => self.url = url,
            Effect::Show { css, text } => self.script.elements.push(ScriptElement {
                css,
                text,
                disabled: false,
                value: String::new(),
            }),
            Effect::Hide(css) => self.script.elements.retain(|element| element.css != css),
        }
    }

    fn alive(&self) -> BrowserResult<()> {
        if self.crashed || self.closed {
            Err(BrowserError::PageUnreachable("target closed".into()))
        } else {
            Ok(())
        }
    }
}

fn matches(element: &ScriptElement, locator: &Locator) -> bool {
    element.css == locator.css
        && locator
            .text
            .as_deref()
            .map(|text| element.text.contains(text))
            .unwrap_or(true)
}

/// Read side of a page handed out by [`ScriptedSessionProvider`].
#[derive(Debug, Clone)]
pub struct ScriptedPageHandle {
    state: Arc<Mutex<PageState>>,
}

impl ScriptedPageHandle {
    fn lock(&self) -> MutexGuard<'_, PageState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn actions(&self) -> Vec<PageAction> {
        self.lock().actions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }
}

pub struct ScriptedPage {
    handle: ScriptedPageHandle,
}

impl ScriptedPage {
    fn record(&self, action: PageAction) -> BrowserResult<MutexGuard<'_, PageState>> {
        let mut state = self.handle.lock();
        state.alive()?;
        state.actions.push(action);
        Ok(state)
    }

    fn log(&self, action: PageAction) -> BrowserResult<()> {
        self.record(action).map(drop)
    }

    fn require(state: &PageState, locator: &Locator) -> BrowserResult<()> {
        state
            .find(locator)
            .map(|_| ())
            .ok_or_else(|| BrowserError::ElementNotFound(locator.to_string()))
    }
}

#[async_trait]
impl PageSession for ScriptedPage {
    async fn set_cookies(&self, cookies: &[SessionCookie]) -> BrowserResult<()> {
        self.log(PageAction::SetCookies(cookies.to_vec()))
    }

    async fn goto(&self, url: &str) -> BrowserResult<()> {
        let mut state = self.record(PageAction::Goto(url.to_string()))?;
        let landed = state
            .script
            .redirects
            .get(url)
            .cloned()
            .unwrap_or_else(|| url.to_string());
        state.url = landed;
        if state.script.crash_on_goto {
            state.crashed = true;
        }
        Ok(())
    }

    async fn current_url(&self) -> BrowserResult<String> {
        let state = self.handle.lock();
        state.alive()?;
        Ok(state.url.clone())
    }

    async fn exists(&self, locator: &Locator) -> BrowserResult<bool> {
        let state = self.handle.lock();
        state.alive()?;
        Ok(state.find(locator).is_some())
    }

    async fn text_of(&self, locator: &Locator) -> BrowserResult<Option<String>> {
        let state = self.handle.lock();
        state.alive()?;
        Ok(state.find(locator).map(|element| element.text.clone()))
    }

    async fn element_box(&self, locator: &Locator) -> BrowserResult<ElementBox> {
        let state = self.handle.lock();
        state.alive()?;
        Self::require(&state, locator)?;
        Ok(ElementBox {
            x: 400.0,
            y: 300.0,
            width: 120.0,
            height: 32.0,
        })
    }

    async fn scroll_into_view(&self, locator: &Locator) -> BrowserResult<()> {
        let state = self.record(PageAction::ScrollIntoView(locator.clone()))?;
        Self::require(&state, locator)
    }

    async fn move_mouse(&self, x: f64, y: f64) -> BrowserResult<()> {
        self.log(PageAction::MouseMove { x, y })
    }

    async fn click(&self, locator: &Locator) -> BrowserResult<()> {
        let mut state = self.record(PageAction::Click(locator.clone()))?;
        Self::require(&state, locator)?;
        let effects: Vec<Effect> = state
            .script
            .on_click
            .iter()
            .filter(|(target, _)| {
                target.css == locator.css
                    && (target.text.is_none() || target.text == locator.text)
            })
            .flat_map(|(_, effects)| effects.clone())
            .collect();
        for effect in effects {
            state.apply(effect);
        }
        Ok(())
    }

    async fn focus(&self, locator: &Locator) -> BrowserResult<()> {
        let state = self.record(PageAction::Focus(locator.clone()))?;
        Self::require(&state, locator)
    }

    async fn is_disabled(&self, locator: &Locator) -> BrowserResult<bool> {
        let state = self.handle.lock();
        state.alive()?;
        state
            .find(locator)
            .map(|element| element.disabled)
            .ok_or_else(|| BrowserError::ElementNotFound(locator.to_string()))
    }

    async fn press_key(&self, key: Key) -> BrowserResult<()> {
        self.log(PageAction::Key(key))
    }

    async fn insert_text(&self, text: &str) -> BrowserResult<()> {
        self.log(PageAction::InsertText(text.to_string()))
    }

    async fn write_clipboard(&self, text: &str) -> BrowserResult<()> {
        let state = self.record(PageAction::Clipboard(text.to_string()))?;
        if state.script.clipboard_denied {
            return Err(BrowserError::Script("clipboard permission denied".into()));
        }
        Ok(())
    }

    async fn paste_shortcut(&self) -> BrowserResult<()> {
        self.log(PageAction::Paste)
    }

    async fn fill(&self, locator: &Locator, text: &str) -> BrowserResult<()> {
        let mut state = self.record(PageAction::Fill(locator.clone(), text.to_string()))?;
        let element = state
            .find_mut(locator)
            .ok_or_else(|| BrowserError::ElementNotFound(locator.to_string()))?;
        element.value = text.to_string();
        Ok(())
    }

    async fn blur(&self, locator: &Locator) -> BrowserResult<()> {
        let state = self.record(PageAction::Blur(locator.clone()))?;
        Self::require(&state, locator)
    }

    async fn upload_file(&self, locator: &Locator, path: &Path) -> BrowserResult<()> {
        let state = self.record(PageAction::Upload(locator.clone(), path.to_path_buf()))?;
        Self::require(&state, locator)
    }

    async fn evaluate_json(&self, script: &str) -> BrowserResult<Value> {
        let state = self.record(PageAction::Evaluate(script.to_string()))?;
        Ok(state.script.evaluate_result.clone().unwrap_or(Value::Null))
    }

    async fn cookies(&self) -> BrowserResult<Vec<SessionCookie>> {
        let mut state = self.handle.lock();
        state.alive()?;
        state.cookie_probes += 1;
        if state.cookie_probes > state.script.cookies_after_probes {
            Ok(state.script.cookies.clone())
        } else {
            Ok(Vec::new())
        }
    }

    async fn screenshot(&self, path: &Path) -> BrowserResult<()> {
        self.log(PageAction::Screenshot(path.to_path_buf()))
    }

    async fn close(&self) -> BrowserResult<()> {
        let mut state = self.handle.lock();
        if !state.closed {
            state.actions.push(PageAction::Close);
            state.closed = true;
        }
        Ok(())
    }
}

/// Hands out a fresh [`ScriptedPage`] per `open_page`, each starting from
/// the same script.
#[derive(Debug, Default)]
pub struct ScriptedSessionProvider {
    script: PageScript,
    pages: Mutex<Vec<ScriptedPageHandle>>,
    invalidations: AtomicUsize,
}

impl ScriptedSessionProvider {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            pages: Mutex::new(Vec::new()),
            invalidations: AtomicUsize::new(0),
        }
    }

    pub fn pages(&self) -> Vec<ScriptedPageHandle> {
        self.pages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn pages_opened(&self) -> usize {
        self.pages().len()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for ScriptedSessionProvider {
    async fn open_page(&self, url: &str) -> BrowserResult<Box<dyn PageSession>> {
        let handle = ScriptedPageHandle {
            state: Arc::new(Mutex::new(PageState {
                script: self.script.clone(),
                url: self
                    .script
                    .redirects
                    .get(url)
                    .cloned()
                    .unwrap_or_else(|| url.to_string()),
                actions: Vec::new(),
                closed: false,
                crashed: false,
                cookie_probes: 0,
            })),
        };
        self.pages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle.clone());
        let page = ScriptedPage { handle };
        let setup = if self.script.fail_setup {
            Err(BrowserError::Script("stealth script rejected".into()))
        } else {
            Ok(())
        };
        close_on_setup_error(&page, setup).await?;
        Ok(Box::new(page))
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

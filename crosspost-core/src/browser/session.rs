use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::BrowserResult;

/// A CSS selector, optionally narrowed to elements whose visible text
/// contains `text`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub css: String,
    pub text: Option<String>,
}

impl Locator {
    pub fn css(css: impl Into<String>) -> Self {
        Self {
            css: css.into(),
            text: None,
        }
    }

    pub fn with_text(css: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            css: css.into(),
            text: Some(text.into()),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ~ {:?}", self.css, text),
            None => f.write_str(&self.css),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    Backspace,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
    #[serde(default)]
    pub same_site_lax: bool,
}

impl SessionCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".into(),
            secure: true,
            http_only: true,
            same_site_lax: false,
        }
    }

    pub fn same_site_lax(mut self) -> Self {
        self.same_site_lax = true;
        self
    }
}

/// One browser tab, exclusively owned by a single task attempt.
#[async_trait]
pub trait PageSession: Send + Sync {
    async fn set_cookies(&self, cookies: &[SessionCookie]) -> BrowserResult<()>;

    async fn goto(&self, url: &str) -> BrowserResult<()>;

    /// Doubles as the liveness probe: fails once the tab is gone.
    async fn current_url(&self) -> BrowserResult<String>;

    async fn exists(&self, locator: &Locator) -> BrowserResult<bool>;

    async fn text_of(&self, locator: &Locator) -> BrowserResult<Option<String>>;

    async fn element_box(&self, locator: &Locator) -> BrowserResult<ElementBox>;

    async fn scroll_into_view(&self, locator: &Locator) -> BrowserResult<()>;

    async fn move_mouse(&self, x: f64, y: f64) -> BrowserResult<()>;

    async fn click(&self, locator: &Locator) -> BrowserResult<()>;

    async fn focus(&self, locator: &Locator) -> BrowserResult<()>;

    async fn is_disabled(&self, locator: &Locator) -> BrowserResult<bool>;

    /// Sends a key to whatever element currently has focus.
    async fn press_key(&self, key: Key) -> BrowserResult<()>;

    /// Inserts text at the caret without key events.
    async fn insert_text(&self, text: &str) -> BrowserResult<()>;

    async fn write_clipboard(&self, text: &str) -> BrowserResult<()>;

    async fn paste_shortcut(&self) -> BrowserResult<()>;

    /// Replaces the value of an input or textarea.
    async fn fill(&self, locator: &Locator, text: &str) -> BrowserResult<()>;

    async fn blur(&self, locator: &Locator) -> BrowserResult<()>;

    async fn upload_file(&self, locator: &Locator, path: &Path) -> BrowserResult<()>;

    async fn evaluate_json(&self, script: &str) -> BrowserResult<Value>;

    async fn cookies(&self) -> BrowserResult<Vec<SessionCookie>>;

    async fn screenshot(&self, path: &Path) -> BrowserResult<()>;

    async fn close(&self) -> BrowserResult<()>;
}

pub const BLANK_PAGE: &str = "about:blank";

/// Hands out stealth pages from a shared browser. Closing a page is the
/// caller's job.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn open_page(&self, url: &str) -> BrowserResult<Box<dyn PageSession>>;

    /// Drops the shared browser so the next `open_page` relaunches it.
    async fn invalidate(&self);
}

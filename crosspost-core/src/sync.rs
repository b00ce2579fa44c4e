//! Read path: scrape each platform's own post listing with the stored
//! session and reconcile it into the local unified posts table.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{
    wait_until, BrowserError, PageGuard, PageSession, PollSpec, SessionCookie, SessionProvider,
    WaitOutcome, BLANK_PAGE,
};
use crate::config::SyncSection;
use crate::credentials::{CredentialError, CredentialResolver};
use crate::driver::PlatformProfile;
use crate::metrics::PipelineMetrics;
use crate::platform::Platform;
use crate::queue::{HandlerError, MessageHandler, SyncTask};
use crate::sqlite::configure_connection;

const LISTING_POLL_INTERVAL: Duration = Duration::from_millis(500);

const POSTS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS unified_posts (
    user_id INTEGER NOT NULL,
    platform TEXT NOT NULL,
    remote_id TEXT NOT NULL,
    title TEXT NOT NULL,
    url TEXT NOT NULL,
    status TEXT NOT NULL,
    views INTEGER,
    reactions INTEGER,
    comments INTEGER,
    published_at TEXT,
    synced_at TEXT NOT NULL,
    PRIMARY KEY (user_id, platform, remote_id)
);
CREATE INDEX IF NOT EXISTS idx_unified_posts_user ON unified_posts(user_id, platform);
";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{0} has no post listing to sync")]
    Unsupported(Platform),
    #[error("no {platform} credentials for user {user_id}")]
    CredentialsMissing { platform: Platform, user_id: i64 },
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("session expired: redirected to {url}")]
    SessionExpired { url: String },
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("listing script returned unexpected data: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to open post store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("post store error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sync task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid sync task: {0}")]
    InvalidTask(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedPost {
    pub platform: Platform,
    pub remote_id: String,
    pub title: String,
    pub url: String,
    pub status: String,
    pub views: Option<u64>,
    pub reactions: Option<u64>,
    pub comments: Option<u64>,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Idempotent on (user, platform, remote id).
    async fn upsert_post(&self, user_id: i64, post: &UnifiedPost) -> SyncResult<()>;

    async fn list_posts(
        &self,
        user_id: i64,
        platform: Option<Platform>,
    ) -> SyncResult<Vec<UnifiedPost>>;
}

#[derive(Debug, Clone)]
pub struct SqlitePostStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqlitePostStore {
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        store.connect()?.execute_batch(POSTS_SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> SyncResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            SyncError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    fn upsert_blocking(&self, user_id: i64, post: &UnifiedPost) -> SyncResult<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO unified_posts
                (user_id, platform, remote_id, title, url, status, views, reactions, comments, published_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(user_id, platform, remote_id) DO UPDATE SET
                title = excluded.title,
                url = excluded.url,
                status = excluded.status,
                views = COALESCE(excluded.views, unified_posts.views),
                reactions = COALESCE(excluded.reactions, unified_posts.reactions),
                comments = COALESCE(excluded.comments, unified_posts.comments),
                published_at = COALESCE(excluded.published_at, unified_posts.published_at),
                synced_at = excluded.synced_at",
            params![
                user_id,
                post.platform.as_str(),
                post.remote_id,
                post.title,
                post.url,
                post.status,
                post.views.map(to_sql_count),
                post.reactions.map(to_sql_count),
                post.comments.map(to_sql_count),
                post.published_at,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    fn list_blocking(&self, user_id: i64, platform: Option<Platform>) -> SyncResult<Vec<UnifiedPost>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT platform, remote_id, title, url, status, views, reactions, comments, published_at
             FROM unified_posts
             WHERE user_id = ?1 AND (?2 IS NULL OR platform = ?2)
             ORDER BY published_at DESC, remote_id",
        )?;
        let rows = stmt.query_map(params![user_id, platform.map(|p| p.as_str())], |row| {
            let platform: String = row.get(0)?;
            let views: Option<i64> = row.get(5)?;
            let reactions: Option<i64> = row.get(6)?;
            let comments: Option<i64> = row.get(7)?;
            Ok((
                platform,
                UnifiedPost {
                    platform: Platform::Medium,
                    remote_id: row.get(1)?,
                    title: row.get(2)?,
                    url: row.get(3)?,
                    status: row.get(4)?,
                    views: views.and_then(|v| u64::try_from(v).ok()),
                    reactions: reactions.and_then(|v| u64::try_from(v).ok()),
                    comments: comments.and_then(|v| u64::try_from(v).ok()),
                    published_at: row.get(8)?,
                },
            ))
        })?;
        let mut posts = Vec::new();
        for row in rows {
            let (platform, mut post) = row?;
            let Ok(platform) = platform.parse::<Platform>() else {
                continue;
            };
            post.platform = platform;
            posts.push(post);
        }
        Ok(posts)
    }
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl PostStore for SqlitePostStore {
    async fn upsert_post(&self, user_id: i64, post: &UnifiedPost) -> SyncResult<()> {
        let store = self.clone();
        let post = post.clone();
        tokio::task::spawn_blocking(move || store.upsert_blocking(user_id, &post)).await?
    }

    async fn list_posts(
        &self,
        user_id: i64,
        platform: Option<Platform>,
    ) -> SyncResult<Vec<UnifiedPost>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking(user_id, platform)).await?
    }
}

/// Where a platform lists the user's posts and how to read each entry.
/// Every selector list is ordered from most to least specific.
#[derive(Debug, Clone, Serialize)]
pub struct ListingSpec {
    #[serde(skip)]
    pub platform: Platform,
    #[serde(skip)]
    pub url: &'static str,
    pub containers: Vec<&'static str>,
    pub titles: Vec<&'static str>,
    pub links: Vec<&'static str>,
    pub statuses: Vec<&'static str>,
    pub times: Vec<&'static str>,
    /// Unlabelled numeric cells read in order as reactions then comments.
    pub series: Vec<&'static str>,
    pub views: Vec<&'static str>,
    pub reactions: Vec<&'static str>,
    pub comments: Vec<&'static str>,
}

impl ListingSpec {
    pub fn for_platform(platform: Platform) -> Option<Self> {
        match platform {
            Platform::Medium => Some(Self {
                platform,
                url: "https://medium.com/me/stories?tab=posts-published",
                containers: vec!["table tbody tr", "article", "h2, h3"],
                titles: vec!["a[href*='/p/'] h2", "h2", "h3", "a[href*='/p/']", "a[href*='/@']"],
                links: vec!["a[href*='/p/']", "a[href*='/@']", "a"],
                statuses: Vec::new(),
                times: vec!["time"],
                series: vec!["svg + p", "p"],
                views: Vec::new(),
                reactions: Vec::new(),
                comments: Vec::new(),
            }),
            Platform::DevTo => Some(Self {
                platform,
                url: "https://dev.to/dashboard",
                containers: vec![
                    ".dashboard-story",
                    ".js-dashboard-story",
                    ".crayons-card .dashboard-story",
                    ".crayons-card .js-dashboard-story",
                    "[data-testid=\"dashboard-article\"]",
                    "[data-testid=\"dashboard-post\"]",
                    ".dashboard__article",
                    ".crayons-story",
                    ".article-card",
                    ".crayons-card",
                    "article",
                ],
                titles: vec![
                    ".dashboard-story__title a",
                    ".crayons-story__title a",
                    "h3 a",
                    "h2 a",
                    "a",
                ],
                links: vec![
                    ".dashboard-story__title a",
                    ".crayons-story__title a",
                    "h3 a",
                    "h2 a",
                    "a",
                ],
                statuses: vec![
                    ".js-dashboard-story-details strong",
                    ".crayons-pill",
                    ".crayons-tag",
                    ".crayons-badge",
                    ".dashboard-article__status",
                    ".article-status",
                ],
                times: vec![".js-dashboard-story-details time", "time"],
                series: Vec::new(),
                views: vec!["span[title=\"Views\"]"],
                reactions: vec!["span[title=\"Reactions\"]"],
                comments: vec![
                    "span[title=\"Comments\"] .spec__comments-count",
                    "span[title=\"Comments\"]",
                ],
            }),
            Platform::LinkedIn => None,
        }
    }

    /// Page expression returning one raw entry per container of the first
    /// container selector that matches anything.
    pub fn script(&self) -> String {
        let config = serde_json::to_string(self).unwrap_or_else(|_| "{}".into());
        format!("({LISTING_SCRIPT})({config})")
    }
}

const LISTING_SCRIPT: &str = r#"(cfg) => {
  const clean = (text) => (text || "").replace(/\s+/g, " ").trim();
  const firstText = (root, sels) => {
    for (const sel of sels) {
      const el = root.querySelector(sel);
      if (el && clean(el.textContent)) return clean(el.textContent);
    }
    return "";
  };
  const firstHref = (root, sels) => {
    for (const sel of sels) {
      const el = root.querySelector(sel);
      const href = el && el.getAttribute("href");
      if (href && href.trim()) return href.trim();
    }
    const up = root.closest && root.closest("a[href]");
    return up ? up.getAttribute("href").trim() : "";
  };
  const firstTime = (root, sels) => {
    for (const sel of sels) {
      const el = root.querySelector(sel);
      if (!el) continue;
      const dt = el.getAttribute("datetime");
      if (dt && dt.trim()) return dt.trim();
      if (clean(el.textContent)) return clean(el.textContent);
    }
    return "";
  };
  const numeric = /^\d+(?:[.,]\d+)?[KM]?$/;
  let roots = [];
  for (const sel of cfg.containers) {
    const found = Array.from(document.querySelectorAll(sel));
    if (found.length) { roots = found; break; }
  }
  return roots.map((root) => {
    let series = [];
    for (const sel of cfg.series) {
      series = Array.from(root.querySelectorAll(sel))
        .map((el) => clean(el.textContent))
        .filter((text) => numeric.test(text));
      if (series.length) break;
    }
    return {
      title: firstText(root, cfg.titles) || clean(root.textContent),
      href: firstHref(root, cfg.links),
      statuses: cfg.statuses.flatMap((sel) =>
        Array.from(root.querySelectorAll(sel)).map((el) => clean(el.textContent))),
      time: firstTime(root, cfg.times),
      views: firstText(root, cfg.views),
      reactions: firstText(root, cfg.reactions) || series[0] || "",
      comments: firstText(root, cfg.comments) || series[1] || "",
    };
  });
}"#;

/// One entry exactly as the listing script reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawListingItem {
    pub title: String,
    pub href: String,
    pub statuses: Vec<String>,
    pub time: String,
    pub views: String,
    pub reactions: String,
    pub comments: String,
}

const STATUS_WORDS: [&str; 5] = ["published", "draft", "scheduled", "archived", "unlisted"];

pub fn normalize_listing(
    platform: Platform,
    items: Vec<RawListingItem>,
    limit: usize,
) -> Vec<UnifiedPost> {
    let mut seen = HashSet::new();
    let mut posts = Vec::new();
    for item in items {
        if limit > 0 && posts.len() >= limit {
            break;
        }
        let title = collapse_whitespace(&item.title);
        if title.is_empty() {
            continue;
        }
        let Some(url) = normalize_url(platform, &item.href) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        posts.push(UnifiedPost {
            platform,
            remote_id: url.clone(),
            title,
            url,
            status: classify_status(platform, &item.statuses),
            views: parse_count(&item.views),
            reactions: parse_count(&item.reactions),
            comments: parse_count(&item.comments),
            published_at: DateTime::parse_from_rfc3339(item.time.trim())
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
        });
    }
    posts
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn normalize_url(platform: Platform, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    match platform {
        Platform::Medium => {
            let absolute = if href.starts_with('/') {
                format!("https://medium.com{href}")
            } else {
                href.to_string()
            };
            let url = absolute
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string();
            (url.contains("/@") || url.contains("/p/")).then_some(url)
        }
        Platform::DevTo => {
            if !is_devto_post_path(href) {
                return None;
            }
            if href.starts_with("http://") || href.starts_with("https://") {
                Some(href.to_string())
            } else if href.starts_with('/') {
                Some(format!("https://dev.to{href}"))
            } else {
                Some(format!("https://dev.to/{href}"))
            }
        }
        Platform::LinkedIn => None,
    }
}

/// Dev.to post links look like `/<user>/<slug>`; navigation links do not.
fn is_devto_post_path(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    if ["dashboard", "settings", "notifications", "signout", "enter"]
        .iter()
        .any(|word| lower.contains(word))
    {
        return false;
    }
    let trimmed = lower
        .trim_start_matches("https://dev.to")
        .trim_start_matches("http://dev.to")
        .trim_matches('/');
    !trimmed.is_empty() && trimmed.contains('/')
}

fn classify_status(platform: Platform, labels: &[String]) -> String {
    for label in labels {
        let lower = label.to_ascii_lowercase();
        if let Some(word) = STATUS_WORDS.iter().find(|word| lower.contains(*word)) {
            return (*word).to_string();
        }
    }
    match platform {
        Platform::Medium => "published".into(),
        _ => "unknown".into(),
    }
}

/// Reads display counts such as `1,204`, `3.4K` or `12 views`. Capped
/// displays like `< 25` or `Less than 25 views` are not counts.
pub fn parse_count(text: &str) -> Option<u64> {
    static COUNT: OnceLock<Option<Regex>> = OnceLock::new();
    if text.contains('<') || text.to_lowercase().contains("less than") {
        return None;
    }
    let cleaned = text.replace(',', "");
    let pattern = COUNT
        .get_or_init(|| Regex::new(r"(\d+(?:\.\d+)?)\s*([KkMm])?").ok())
        .as_ref()?;
    let captures = pattern.captures(&cleaned)?;
    let base: f64 = captures.get(1)?.as_str().parse().ok()?;
    let scale = match captures.get(2).map(|m| m.as_str()) {
        Some("K" | "k") => 1_000.0,
        Some("M" | "m") => 1_000_000.0,
        _ => 1.0,
    };
    Some((base * scale).round() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub limit: usize,
    pub listing_poll: PollSpec,
}

impl SyncSettings {
    pub fn from_section(section: &SyncSection) -> Self {
        Self {
            limit: section.limit,
            listing_poll: PollSpec::from_timeout(
                Duration::from_secs(section.listing_timeout_seconds),
                LISTING_POLL_INTERVAL,
            ),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_section(&SyncSection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub platform: Platform,
    pub fetched: usize,
    pub upserted: usize,
}

pub struct SyncService {
    sessions: Arc<dyn SessionProvider>,
    resolver: CredentialResolver,
    store: Arc<dyn PostStore>,
    metrics: Arc<PipelineMetrics>,
    settings: SyncSettings,
}

impl SyncService {
    pub fn new(
        sessions: Arc<dyn SessionProvider>,
        resolver: CredentialResolver,
        store: Arc<dyn PostStore>,
        metrics: Arc<PipelineMetrics>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            sessions,
            resolver,
            store,
            metrics,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn PostStore> {
        &self.store
    }

    pub async fn sync(&self, user_id: i64, platform: Platform) -> SyncResult<SyncReport> {
        let spec = ListingSpec::for_platform(platform).ok_or(SyncError::Unsupported(platform))?;
        let credential = self
            .resolver
            .resolve(user_id, platform)
            .await?
            .ok_or(SyncError::CredentialsMissing { platform, user_id })?;

        info!(target: "sync", user_id, %platform, "syncing post listing");
        let guard = match PageGuard::open(
            self.sessions.as_ref(),
            BLANK_PAGE,
            Arc::clone(&self.metrics),
            format!("sync-{platform}"),
        )
        .await
        {
            Ok(guard) => guard,
            Err(err) => {
                if err.is_crash() || matches!(err, BrowserError::Launch(_)) {
                    self.sessions.invalidate().await;
                }
                return Err(err.into());
            }
        };
        let scraped = self
            .scrape(guard.page(), &spec, &credential.cookies())
            .await;
        if let Err(err) = guard.close().await {
            debug!(target: "sync", error = %err, "closing sync page failed");
        }
        let items = match scraped {
            Ok(items) => items,
            Err(SyncError::Browser(err)) if err.is_crash() => {
                self.sessions.invalidate().await;
                return Err(SyncError::Browser(err));
            }
            Err(err) => return Err(err),
        };

        let fetched = items.len();
        let posts = normalize_listing(platform, items, self.settings.limit);
        let mut upserted = 0;
        for post in &posts {
            match self.store.upsert_post(user_id, post).await {
                Ok(()) => upserted += 1,
                Err(err) => warn!(
                    target: "sync",
                    user_id,
                    %platform,
                    remote_id = %post.remote_id,
                    error = %err,
                    "failed to save post"
                ),
            }
        }
        self.metrics.record_sync(upserted);
        info!(target: "sync", user_id, %platform, fetched, upserted, "sync complete");
        Ok(SyncReport {
            platform,
            fetched,
            upserted,
        })
    }

    async fn scrape(
        &self,
        page: &dyn PageSession,
        spec: &ListingSpec,
        cookies: &[SessionCookie],
    ) -> SyncResult<Vec<RawListingItem>> {
        page.set_cookies(cookies).await?;
        page.goto(spec.url).await?;
        let profile = PlatformProfile::for_platform(spec.platform);
        let landed = page.current_url().await?;
        if profile.is_login_url(&landed) {
            return Err(SyncError::SessionExpired { url: landed });
        }

        let script = spec.script();
        let outcome = wait_until(self.settings.listing_poll, |_| {
            let script = script.as_str();
            async move {
                let value = page.evaluate_json(script).await?;
                let items = decode_items(value)?;
                Ok::<_, SyncError>((!items.is_empty()).then_some(items))
            }
        })
        .await;
        match outcome {
            WaitOutcome::Succeeded(items) => Ok(items),
            WaitOutcome::Errored(err) => Err(err),
            WaitOutcome::TimedOut => {
                let landed = page.current_url().await?;
                if profile.is_login_url(&landed) {
                    return Err(SyncError::SessionExpired { url: landed });
                }
                debug!(target: "sync", platform = %spec.platform, "listing is empty");
                Ok(Vec::new())
            }
        }
    }
}

fn decode_items(value: Value) -> SyncResult<Vec<RawListingItem>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl MessageHandler for SyncService {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        let task = SyncTask::decode(body)
            .map_err(|err| Box::new(SyncError::InvalidTask(err.to_string())) as HandlerError)?;
        self.sync(task.user_id, task.platform)
            .await
            .map(|_| ())
            .map_err(|err| {
                warn!(target: "sync", user_id = task.user_id, platform = %task.platform, error = %err, "sync failed");
                Box::new(err) as HandlerError
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn listing_item(title: &str, href: &str) -> RawListingItem {
        RawListingItem {
            title: title.into(),
            href: href.into(),
            ..RawListingItem::default()
        }
    }

    fn listing_fixture(items: &[RawListingItem]) -> Value {
        json!(items
            .iter()
            .map(|item| json!({
                "title": item.title,
                "href": item.href,
                "statuses": item.statuses,
                "time": item.time,
                "views": item.views,
                "reactions": item.reactions,
                "comments": item.comments,
            }))
            .collect::<Vec<_>>())
    }

    #[test]
    fn counts_handle_separators_suffixes_and_caps() {
        assert_eq!(parse_count("1,204"), Some(1204));
        assert_eq!(parse_count("3.4K"), Some(3400));
        assert_eq!(parse_count("2M views"), Some(2_000_000));
        assert_eq!(parse_count("< 25"), None);
        assert_eq!(parse_count("Less than 25 views"), None);
        assert_eq!(parse_count("less than 10"), None);
        assert_eq!(parse_count(""), None);
    }

    #[test]
    fn medium_urls_are_absolute_and_query_free() {
        let posts = normalize_listing(
            Platform::Medium,
            vec![
                listing_item(" My  story ", "/@me/my-story-abc?source=stories"),
                listing_item("Dup", "https://medium.com/@me/my-story-abc"),
                listing_item("Nav", "/me/settings"),
            ],
            20,
        );
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "My story");
        assert_eq!(posts[0].url, "https://medium.com/@me/my-story-abc");
        assert_eq!(posts[0].remote_id, posts[0].url);
        assert_eq!(posts[0].status, "published");
    }

    #[test]
    fn devto_rejects_navigation_links_and_reads_stats() {
        let mut item = listing_item("Post", "/me/post-1");
        item.statuses = vec!["Draft:".into()];
        item.views = "< 25".into();
        item.reactions = "1,024".into();
        item.time = "2024-05-01T10:00:00Z".into();
        let posts = normalize_listing(
            Platform::DevTo,
            vec![item, listing_item("Settings", "/settings/profile")],
            20,
        );
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].url, "https://dev.to/me/post-1");
        assert_eq!(posts[0].status, "draft");
        assert_eq!(posts[0].views, None);
        assert_eq!(posts[0].reactions, Some(1024));
        assert!(posts[0].published_at.is_some());
    }

    #[test]
    fn limit_caps_output() {
        let items = (0..5)
            .map(|i| listing_item("t", &format!("/me/post-{i}")))
            .collect();
        assert_eq!(normalize_listing(Platform::DevTo, items, 2).len(), 2);
    }

    #[test]
    fn script_embeds_container_strategies() {
        let script = ListingSpec::for_platform(Platform::DevTo).unwrap().script();
        assert!(script.contains(".dashboard-story"));
        assert!(ListingSpec::for_platform(Platform::LinkedIn).is_none());
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = SqlitePostStore::open(dir.path().join("posts.sqlite")).unwrap();
        let mut post = normalize_listing(
            Platform::DevTo,
            vec![listing_item("Post", "/me/post-1")],
            20,
        )
        .remove(0);
        post.views = Some(10);
        store.upsert_post(1, &post).await.unwrap();
        post.views = None;
        post.title = "Renamed".into();
        store.upsert_post(1, &post).await.unwrap();

        let posts = store.list_posts(1, Some(Platform::DevTo)).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "Renamed");
        assert_eq!(posts[0].views, Some(10));
        assert!(store.list_posts(2, None).await.unwrap().is_empty());
    }

    #[test]
    fn fixture_decodes_back_into_items() {
        let items = vec![listing_item("a", "/me/a")];
        assert_eq!(decode_items(listing_fixture(&items)).unwrap(), items);
        assert!(decode_items(Value::Null).unwrap().is_empty());
    }
}

//! Per-user platform sessions: the SQLite store, the validated
//! [`PlatformCredential`] shapes and the environment fallback.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use tracing::{debug, warn};

use crate::browser::SessionCookie;
use crate::driver::SessionCookieSpec;
use crate::platform::Platform;
use crate::sqlite::configure_connection;

const CREDENTIAL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_credentials (
    user_id INTEGER NOT NULL,
    platform TEXT NOT NULL,
    payload TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, platform)
);
";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to open credential store {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("credential store error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("credential payload is not a string map: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid {platform} credential: {reason}")]
    Invalid { platform: Platform, reason: String },
}

pub type CredentialResult<T> = Result<T, CredentialError>;

pub type CredentialMap = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub values: CredentialMap,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when nothing is stored for the pair.
    async fn get_credentials(
        &self,
        user_id: i64,
        platform: Platform,
    ) -> CredentialResult<Option<StoredCredential>>;

    async fn save_credentials(
        &self,
        user_id: i64,
        platform: Platform,
        values: &CredentialMap,
    ) -> CredentialResult<()>;
}

#[derive(Debug, Clone)]
pub struct SqliteCredentialStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteCredentialStore {
    pub fn open(path: impl AsRef<Path>) -> CredentialResult<Self> {
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
        store.connect()?.execute_batch(CREDENTIAL_SCHEMA)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> CredentialResult<Connection> {
        let conn =
            Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
                CredentialError::Open {
                    source,
                    path: self.path.clone(),
                }
            })?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    fn get_blocking(
        &self,
        user_id: i64,
        platform: Platform,
    ) -> CredentialResult<Option<StoredCredential>> {
        let conn = self.connect()?;
        let row: Option<(String, DateTime<Utc>)> = conn
            .query_row(
                "SELECT payload, updated_at FROM user_credentials WHERE user_id = ?1 AND platform = ?2",
                params![user_id, platform.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match row {
            Some((payload, updated_at)) => Ok(Some(StoredCredential {
                values: serde_json::from_str(&payload)?,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    fn save_blocking(
        &self,
        user_id: i64,
        platform: Platform,
        values: &CredentialMap,
    ) -> CredentialResult<()> {
        let payload = serde_json::to_string(values)?;
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO user_credentials (user_id, platform, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, platform) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![user_id, platform.as_str(), payload, Utc::now()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn get_credentials(
        &self,
        user_id: i64,
        platform: Platform,
    ) -> CredentialResult<Option<StoredCredential>> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.get_blocking(user_id, platform)).await?
    }

    async fn save_credentials(
        &self,
        user_id: i64,
        platform: Platform,
        values: &CredentialMap,
    ) -> CredentialResult<()> {
        let store = self.clone();
        let values = values.clone();
        tokio::task::spawn_blocking(move || store.save_blocking(user_id, platform, &values))
            .await?
    }
}

/// A stored session validated into the shape its platform needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCredential {
    Medium {
        uid: String,
        sid: String,
        xsrf: Option<String>,
    },
    DevTo {
        token: String,
    },
    LinkedIn {
        li_at: String,
    },
}

impl PlatformCredential {
    pub fn parse(platform: Platform, values: &CredentialMap) -> CredentialResult<Self> {
        let field = |key: &str| {
            values
                .get(key)
                .map(|value| value.trim())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let invalid = |reason: &str| CredentialError::Invalid {
            platform,
            reason: reason.to_string(),
        };
        match platform {
            Platform::Medium => Ok(PlatformCredential::Medium {
                uid: field("uid").ok_or_else(|| invalid("missing uid"))?,
                sid: field("sid").ok_or_else(|| invalid("missing sid"))?,
                xsrf: field("xsrf"),
            }),
            Platform::DevTo => {
                let token = field("remember_user_token")
                    .or_else(|| field("token"))
                    .ok_or_else(|| invalid("missing remember_user_token"))?;
                Ok(PlatformCredential::DevTo { token })
            }
            Platform::LinkedIn => Ok(PlatformCredential::LinkedIn {
                li_at: field("li_at").ok_or_else(|| invalid("missing li_at"))?,
            }),
        }
    }

    /// Picks the session cookies out of a logged-in browser's cookie jar.
    pub fn from_cookies(platform: Platform, cookies: &[SessionCookie]) -> Option<Self> {
        let values: CredentialMap = cookies
            .iter()
            .map(|cookie| (cookie.name.clone(), cookie.value.clone()))
            .collect();
        Self::parse(platform, &values).ok()
    }

    pub fn platform(&self) -> Platform {
        match self {
            PlatformCredential::Medium { .. } => Platform::Medium,
            PlatformCredential::DevTo { .. } => Platform::DevTo,
            PlatformCredential::LinkedIn { .. } => Platform::LinkedIn,
        }
    }

    pub fn to_map(&self) -> CredentialMap {
        let mut map = CredentialMap::new();
        match self {
            PlatformCredential::Medium { uid, sid, xsrf } => {
                map.insert("uid".into(), uid.clone());
                map.insert("sid".into(), sid.clone());
                if let Some(xsrf) = xsrf {
                    map.insert("xsrf".into(), xsrf.clone());
                }
            }
            PlatformCredential::DevTo { token } => {
                map.insert("remember_user_token".into(), token.clone());
            }
            PlatformCredential::LinkedIn { li_at } => {
                map.insert("li_at".into(), li_at.clone());
            }
        }
        map
    }

    pub fn cookies(&self) -> Vec<SessionCookie> {
        let spec = SessionCookieSpec::for_platform(self.platform());
        let cookie = |name: &str, value: &str| {
            let cookie = SessionCookie::new(name, value, spec.domain);
            if spec.same_site_lax {
                cookie.same_site_lax()
            } else {
                cookie
            }
        };
        match self {
            PlatformCredential::Medium { uid, sid, xsrf } => {
                let mut cookies = vec![cookie("uid", uid), cookie("sid", sid)];
                if let Some(xsrf) = xsrf {
                    cookies.push(cookie("xsrf", xsrf));
                }
                cookies
            }
            PlatformCredential::DevTo { token } => vec![cookie("remember_user_token", token)],
            PlatformCredential::LinkedIn { li_at } => vec![cookie("li_at", li_at)],
        }
    }
}

/// Operator-provided sessions read from the environment.
#[derive(Debug, Clone, Default)]
pub struct EnvFallback {
    values: BTreeMap<String, String>,
}

impl EnvFallback {
    const KEYS: [&'static str; 5] = [
        "MEDIUM_UID",
        "MEDIUM_SID",
        "MEDIUM_XSRF",
        "DEVTO_SESSION_TOKEN",
        "LI_AT",
    ];

    pub fn from_process_env() -> Self {
        Self::from_pairs(
            Self::KEYS
                .iter()
                .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value))),
        )
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .filter(|(_, value): &(String, String)| !value.trim().is_empty())
                .collect(),
        }
    }

    pub fn credential_for(&self, platform: Platform) -> Option<PlatformCredential> {
        let mut map = CredentialMap::new();
        let mut copy = |from: &str, to: &str| {
            if let Some(value) = self.values.get(from) {
                map.insert(to.to_string(), value.clone());
            }
        };
        match platform {
            Platform::Medium => {
                copy("MEDIUM_UID", "uid");
                copy("MEDIUM_SID", "sid");
                copy("MEDIUM_XSRF", "xsrf");
            }
            Platform::DevTo => copy("DEVTO_SESSION_TOKEN", "remember_user_token"),
            Platform::LinkedIn => copy("LI_AT", "li_at"),
        }
        PlatformCredential::parse(platform, &map).ok()
    }
}

/// Store first; the environment only fills in when the store has nothing.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    fallback: EnvFallback,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, fallback: EnvFallback) -> Self {
        Self { store, fallback }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// `Ok(None)` means neither source has a session for the pair.
    pub async fn resolve(
        &self,
        user_id: i64,
        platform: Platform,
    ) -> CredentialResult<Option<PlatformCredential>> {
        match self.store.get_credentials(user_id, platform).await {
            Ok(Some(stored)) if !stored.values.is_empty() => {
                return PlatformCredential::parse(platform, &stored.values).map(Some);
            }
            Ok(_) => {}
            Err(err) => warn!(
                target: "credentials",
                user_id,
                %platform,
                error = %err,
                "credential store unavailable; trying environment"
            ),
        }
        let fallback = self.fallback.credential_for(platform);
        if fallback.is_some() {
            debug!(target: "credentials", user_id, %platform, "using environment credential");
        }
        Ok(fallback)
    }
}

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::PublishState;
use crate::failure::FailureKind;
use crate::platform::Platform;
use crate::sqlite::configure_connection;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("ledger task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

/// How a successful publish reached the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishChannel {
    Api,
    Browser,
}

impl PublishChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishChannel::Api => "api",
            PublishChannel::Browser => "browser",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub platform: Platform,
    pub user_id: i64,
    pub state: Option<PublishState>,
    pub kind: FailureKind,
    pub message: String,
    pub retry_count: u32,
    pub capture: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub platform: Platform,
    pub user_id: i64,
    pub channel: PublishChannel,
    pub duration_ms: i64,
    pub url: Option<String>,
}

/// Append-only record of publish attempts: failures go to a JSON-lines log
/// and SQLite, successful runs to SQLite only.
#[derive(Debug)]
pub struct FailureLedger {
    log: Mutex<File>,
    log_path: PathBuf,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl FailureLedger {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> LedgerResult<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let ledger = Self {
            log: Mutex::new(file),
            log_path,
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        ledger.initialize_db()?;
        Ok(ledger)
    }

    fn initialize_db(&self) -> LedgerResult<()> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS publish_failures (
                ts TEXT NOT NULL,
                platform TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                state TEXT,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                capture_path TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_failures_ts ON publish_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS publish_runs (
                ts TEXT NOT NULL,
                platform TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                channel TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                url TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_publish_runs_ts ON publish_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> LedgerResult<Connection> {
        let conn = Connection::open_with_flags(&self.db_path, self.flags)?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> LedgerResult<()> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO publish_failures (ts, platform, user_id, state, kind, message, retry_count, capture_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                failure.timestamp,
                failure.platform.as_str(),
                failure.user_id,
                failure.state.map(|state| state.as_str()),
                failure.kind.as_str(),
                failure.message,
                i64::from(failure.retry_count),
                failure
                    .capture
                    .as_ref()
                    .map(|path| path.to_string_lossy().to_string()),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunRecord) -> LedgerResult<()> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO publish_runs (ts, platform, user_id, channel, duration_ms, url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.timestamp,
                run.platform.as_str(),
                run.user_id,
                run.channel.as_str(),
                run.duration_ms,
                run.url,
            ],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_failures(
        &self,
        platform: Option<Platform>,
        limit: usize,
    ) -> LedgerResult<Vec<FailureRecord>> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT ts, platform, user_id, state, kind, message, retry_count, capture_path
             FROM publish_failures
             WHERE ?1 IS NULL OR platform = ?1
             ORDER BY ts DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![platform.map(|p| p.as_str()), limit as i64],
            failure_from_row,
        )?;
        let mut failures = Vec::new();
        for row in rows {
            if let Some(failure) = row? {
                failures.push(failure);
            }
        }
        Ok(failures)
    }

    pub fn run_count(&self, platform: Platform) -> LedgerResult<i64> {
        let conn = self.open_db()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM publish_runs WHERE platform = ?1",
            params![platform.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

/// Rows with a platform or kind this build no longer knows are skipped.
fn failure_from_row(row: &Row<'_>) -> rusqlite::Result<Option<FailureRecord>> {
    let platform: String = row.get(1)?;
    let state: Option<String> = row.get(3)?;
    let kind: String = row.get(4)?;
    let retry_count: i64 = row.get(6)?;
    let capture: Option<String> = row.get(7)?;

    let Ok(platform) = platform.parse::<Platform>() else {
        return Ok(None);
    };
    let Some(kind) = parse_snake::<FailureKind>(&kind) else {
        return Ok(None);
    };
    Ok(Some(FailureRecord {
        timestamp: row.get(0)?,
        platform,
        user_id: row.get(2)?,
        state: state.as_deref().and_then(parse_snake::<PublishState>),
        kind,
        message: row.get(5)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        capture: capture.map(PathBuf::from),
    }))
}

fn parse_snake<T: serde::de::DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn failure(platform: Platform, kind: FailureKind) -> FailureRecord {
        FailureRecord {
            timestamp: Utc::now(),
            platform,
            user_id: 7,
            state: Some(PublishState::TitleEntered),
            kind,
            message: "save not confirmed".into(),
            retry_count: 1,
            capture: Some(PathBuf::from("data/captures/medium.png")),
        }
    }

    #[test]
    fn ledger_persists_failures_and_runs() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("logs/failures.log");
        let db_path = dir.path().join("ledger.sqlite");
        let ledger = FailureLedger::new(&log_path, &db_path).unwrap();

        ledger
            .record_failure(&failure(Platform::Medium, FailureKind::SyncTimeout))
            .unwrap();
        ledger
            .record_failure(&failure(Platform::DevTo, FailureKind::WafBlock))
            .unwrap();
        ledger
            .record_run(&RunRecord {
                timestamp: Utc::now(),
                platform: Platform::Medium,
                user_id: 7,
                channel: PublishChannel::Browser,
                duration_ms: 1200,
                url: Some("https://medium.com/p/abc".into()),
            })
            .unwrap();

        let log_contents = std::fs::read_to_string(&log_path).unwrap();
        assert!(log_contents.contains("sync_timeout"));
        assert_eq!(log_contents.lines().count(), 2);

        let medium = ledger.recent_failures(Some(Platform::Medium), 10).unwrap();
        assert_eq!(medium.len(), 1);
        assert_eq!(medium[0].kind, FailureKind::SyncTimeout);
        assert_eq!(medium[0].state, Some(PublishState::TitleEntered));
        assert_eq!(ledger.recent_failures(None, 10).unwrap().len(), 2);
        assert_eq!(ledger.run_count(Platform::Medium).unwrap(), 1);
    }
}

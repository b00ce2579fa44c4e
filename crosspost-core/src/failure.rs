use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::CircuitOpen;
use crate::browser::BrowserError;
use crate::driver::PublishState;
use crate::platform::Platform;

/// Classification carried by every failed publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    CredentialsMissing,
    SessionExpired,
    WafBlock,
    SyncTimeout,
    PublishTimeout,
    BrowserCrashed,
    CircuitOpen,
    InvalidTask,
    InvalidCredential,
    UnexpectedPage,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::CredentialsMissing => "credentials_missing",
            FailureKind::SessionExpired => "session_expired",
            FailureKind::WafBlock => "waf_block",
            FailureKind::SyncTimeout => "sync_timeout",
            FailureKind::PublishTimeout => "publish_timeout",
            FailureKind::BrowserCrashed => "browser_crashed",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::InvalidTask => "invalid_task",
            FailureKind::InvalidCredential => "invalid_credential",
            FailureKind::UnexpectedPage => "unexpected_page",
        }
    }

    /// Whether another attempt has a realistic chance of succeeding without
    /// a human stepping in.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureKind::CredentialsMissing
                | FailureKind::SyncTimeout
                | FailureKind::PublishTimeout
                | FailureKind::BrowserCrashed
                | FailureKind::CircuitOpen
                | FailureKind::UnexpectedPage
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("no {platform} credentials for user {user_id}")]
    CredentialsMissing { platform: Platform, user_id: i64 },
    #[error("stored {platform} credential is malformed: {reason}")]
    InvalidCredential { platform: Platform, reason: String },
    #[error("session expired: redirected to {url}")]
    SessionExpired { url: String },
    #[error("platform rejected automated input during {state}: {detail}")]
    WafBlock {
        state: PublishState,
        detail: String,
        capture: Option<PathBuf>,
    },
    #[error("save not confirmed during {state}")]
    SyncTimeout { state: PublishState },
    #[error("publish not confirmed after {attempts} polls")]
    PublishTimeout { attempts: u32 },
    #[error("browser crashed during {state}: {source}")]
    BrowserCrashed {
        state: PublishState,
        #[source]
        source: BrowserError,
    },
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpen),
    #[error("invalid task: {0}")]
    InvalidTask(String),
    #[error("unexpected page during {state}: {detail}")]
    UnexpectedPage {
        state: PublishState,
        detail: String,
        capture: Option<PathBuf>,
    },
}

pub type PublishResult<T> = Result<T, PublishError>;

impl PublishError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PublishError::CredentialsMissing { .. } => FailureKind::CredentialsMissing,
            PublishError::InvalidCredential { .. } => FailureKind::InvalidCredential,
            PublishError::SessionExpired { .. } => FailureKind::SessionExpired,
            PublishError::WafBlock { .. } => FailureKind::WafBlock,
            PublishError::SyncTimeout { .. } => FailureKind::SyncTimeout,
            PublishError::PublishTimeout { .. } => FailureKind::PublishTimeout,
            PublishError::BrowserCrashed { .. } => FailureKind::BrowserCrashed,
            PublishError::CircuitOpen(_) => FailureKind::CircuitOpen,
            PublishError::InvalidTask(_) => FailureKind::InvalidTask,
            PublishError::UnexpectedPage { .. } => FailureKind::UnexpectedPage,
        }
    }

    /// Last state the driver reached, when the failure happened inside it.
    pub fn state(&self) -> Option<PublishState> {
        match self {
            PublishError::WafBlock { state, .. }
            | PublishError::SyncTimeout { state }
            | PublishError::BrowserCrashed { state, .. }
            | PublishError::UnexpectedPage { state, .. } => Some(*state),
            PublishError::SessionExpired { .. } => Some(PublishState::SessionInjected),
            PublishError::PublishTimeout { .. } => Some(PublishState::PublishRequested),
            _ => None,
        }
    }

    pub fn capture(&self) -> Option<&Path> {
        match self {
            PublishError::WafBlock { capture, .. } | PublishError::UnexpectedPage { capture, .. } => {
                capture.as_deref()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_variants() {
        let err = PublishError::SyncTimeout {
            state: PublishState::TitleConfirmed,
        };
        assert_eq!(err.kind(), FailureKind::SyncTimeout);
        assert_eq!(err.state(), Some(PublishState::TitleConfirmed));
        assert!(err.kind().is_transient());

        let err = PublishError::from(CircuitOpen {
            name: "medium".into(),
        });
        assert_eq!(err.kind(), FailureKind::CircuitOpen);
        assert!(!FailureKind::SessionExpired.is_transient());
        assert!(!FailureKind::WafBlock.is_transient());
    }
}

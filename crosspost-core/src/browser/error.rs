use chromiumoxide::error::CdpError;
use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium did not start: {0}")]
    Launch(String),
    #[error("devtools call failed: {0}")]
    Cdp(#[from] CdpError),
    #[error("bad browser setup: {0}")]
    Configuration(String),
    #[error("no element matches {0}")]
    ElementNotFound(String),
    #[error("page gone: {0}")]
    PageUnreachable(String),
    #[error("in-page script failed: {0}")]
    Script(String),
}

impl BrowserError {
    /// The tab or the browser process went away; retrying on the same
    /// page is pointless.
    pub fn is_crash(&self) -> bool {
        match self {
            BrowserError::PageUnreachable(_) => true,
            BrowserError::Cdp(err) => matches!(
                err,
                CdpError::Ws(_) | CdpError::ChannelSendError(_) | CdpError::NoResponse
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lost_pages_count_as_crashes() {
        assert!(BrowserError::PageUnreachable("target closed".into()).is_crash());
        assert!(BrowserError::Cdp(CdpError::NoResponse).is_crash());
        assert!(!BrowserError::ElementNotFound("#title".into()).is_crash());
        assert!(!BrowserError::Script("clipboard denied".into()).is_crash());
    }
}

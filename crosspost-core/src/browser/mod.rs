mod chromium;
mod error;
mod fingerprint;
mod guard;
mod human;
pub mod scripted;
mod session;
mod wait;

pub use chromium::{BrowserSessionManager, ChromiumPage};
pub use error::{BrowserError, BrowserResult};
pub use fingerprint::FingerprintMasker;
pub use guard::{close_on_setup_error, PageGuard};
pub use human::{HumanSimulator, Keystroke, MouseStep, Point};
pub use session::{
    ElementBox, Key, Locator, PageSession, SessionCookie, SessionProvider, BLANK_PAGE,
};
pub use wait::{wait_until, PollSpec, WaitOutcome};

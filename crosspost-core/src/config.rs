use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CrosspostConfig {
    pub broker: BrokerSection,
    pub worker: WorkerSection,
    pub breaker: BreakerSection,
    pub browser: BrowserSection,
    pub human: HumanSection,
    pub driver: DriverSection,
    pub storage: StorageSection,
    pub sync: SyncSection,
    pub observability: ObservabilitySection,
}

impl CrosspostConfig {
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "breaker.failure_limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.broker.prefetch == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.prefetch",
                reason: "must be at least 1".into(),
            });
        }
        if self.human.keystroke_ms[0] > self.human.keystroke_ms[1] {
            return Err(ConfigError::Invalid {
                field: "human.keystroke_ms",
                reason: "lower bound exceeds upper bound".into(),
            });
        }
        if self.driver.sync_attempts == 0 || self.driver.publish_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "driver",
                reason: "poll attempts must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub path: String,
    pub dead_letter_exchange: String,
    pub poll_interval_ms: u64,
    pub max_retries: u32,
    pub prefetch: u32,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            path: "data/broker.sqlite".into(),
            dead_letter_exchange: "dlx".into(),
            poll_interval_ms: 250,
            max_retries: 2,
            prefetch: 1,
        }
    }
}

impl BrokerSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub publish_queue: String,
    pub sync_queue: String,
    pub publish_workers: usize,
    pub sync_workers: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            publish_queue: "publish:post".into(),
            sync_queue: "task:sync_platform_activity".into(),
            publish_workers: 5,
            sync_workers: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_limit: u32,
    pub reset_timeout_seconds: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_limit: 3,
            reset_timeout_seconds: 60,
        }
    }
}

impl BreakerSection {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: Option<String>,
    pub headless: Option<bool>,
    pub sandbox: bool,
    pub disable_gpu: bool,
    pub user_agent: String,
    pub viewport: [u32; 2],
    pub lang: Option<String>,
    pub request_timeout_seconds: Option<u64>,
    pub user_data_dir: Option<String>,
    pub disable_blink_features: Vec<String>,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: None,
            sandbox: false,
            disable_gpu: true,
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36".into(),
            viewport: [1920, 1080],
            lang: Some("en-US".into()),
            request_timeout_seconds: Some(30),
            user_data_dir: None,
            disable_blink_features: vec!["AutomationControlled".into()],
        }
    }
}

impl BrowserSection {
    /// Headless unless a human may be watching. An explicit config value wins,
    /// then `BROWSER_HEADLESS`, then production markers (`APP_ENV`, `PORT`).
    pub fn resolve_headless(&self) -> bool {
        if let Some(value) = self.headless {
            return value;
        }
        if let Ok(value) = std::env::var("BROWSER_HEADLESS") {
            if !value.is_empty() {
                return value == "true" || value == "1";
            }
        }
        std::env::var("PORT").is_ok()
            || std::env::var("APP_ENV")
                .map(|env| env == "production")
                .unwrap_or(false)
    }

    pub fn resolve_executable(&self) -> Option<PathBuf> {
        std::env::var("BROWSER_BIN")
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| self.executable_path.clone())
            .map(PathBuf::from)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HumanSection {
    pub scroll_settle_ms: [u32; 2],
    pub reaction_ms: [u32; 2],
    pub keystroke_ms: [u32; 2],
    pub thinking_pause_every: usize,
    pub thinking_pause_max_ms: u32,
    pub mouse_steps: [u32; 2],
    pub mouse_jitter_px: u32,
}

impl Default for HumanSection {
    fn default() -> Self {
        Self {
            scroll_settle_ms: [200, 500],
            reaction_ms: [150, 300],
            keystroke_ms: [30, 80],
            thinking_pause_every: 15,
            thinking_pause_max_ms: 400,
            mouse_steps: [12, 32],
            mouse_jitter_px: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub sync_attempts: u32,
    pub sync_interval_ms: u64,
    pub publish_attempts: u32,
    pub editor_timeout_seconds: u64,
    pub element_timeout_seconds: u64,
    pub capture_dir: String,
    pub medium_api_first: bool,
    pub medium_api_base: String,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            sync_attempts: 15,
            sync_interval_ms: 1000,
            publish_attempts: 60,
            editor_timeout_seconds: 15,
            element_timeout_seconds: 5,
            capture_dir: "data/captures".into(),
            medium_api_first: true,
            medium_api_base: "https://medium.com".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub credentials_db: String,
    pub posts_db: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            credentials_db: "data/credentials.sqlite".into(),
            posts_db: "data/posts.sqlite".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    pub limit: usize,
    pub listing_timeout_seconds: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            limit: 20,
            listing_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    pub failure_log: String,
    pub ledger_db: String,
}

impl Default for ObservabilitySection {
    fn default() -> Self {
        Self {
            failure_log: "data/logs/publish_failures.log".into(),
            ledger_db: "data/ledger.sqlite".into(),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CrosspostConfig> {
    let config: CrosspostConfig = load_toml(path)?;
    config.validate()?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/crosspost.toml");
        let config = load_config(path).expect("fixture config should parse");
        assert_eq!(config.worker.publish_workers, 5);
        assert_eq!(config.worker.publish_queue, "publish:post");
        assert_eq!(config.breaker.failure_limit, 3);
        assert_eq!(config.driver.sync_attempts, 15);
        assert_eq!(config.browser.viewport, [1920, 1080]);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: CrosspostConfig = toml::from_str("[breaker]\nfailure_limit = 5\n").unwrap();
        assert_eq!(config.breaker.failure_limit, 5);
        assert_eq!(config.breaker.reset_timeout_seconds, 60);
        assert_eq!(config.broker.max_retries, 2);
        assert_eq!(config.human.keystroke_ms, [30, 80]);
    }

    #[test]
    fn zero_failure_limit_is_rejected() {
        let config: CrosspostConfig = toml::from_str("[breaker]\nfailure_limit = 0\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "breaker.failure_limit",
                ..
            })
        ));
    }

    #[test]
    fn explicit_headless_flag_wins() {
        let section = BrowserSection {
            headless: Some(false),
            ..BrowserSection::default()
        };
        assert!(!section.resolve_headless());
    }
}

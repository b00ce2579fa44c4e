use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::failure::FailureKind;
use crate::platform::Platform;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub published: BTreeMap<String, u64>,
    pub failed: BTreeMap<String, u64>,
    pub circuit_open_rejections: u64,
    pub api_publishes: u64,
    pub browser_fallbacks: u64,
    pub pages_opened: u64,
    pub pages_closed: u64,
    pub pages_leaked: u64,
    pub sync_runs: u64,
    pub posts_upserted: u64,
}

impl MetricsSnapshot {
    pub fn open_pages(&self) -> u64 {
        self.pages_opened.saturating_sub(self.pages_closed)
    }

    pub fn total_published(&self) -> u64 {
        self.published.values().sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.values().sum()
    }
}

/// Process-wide counters for the publish pipeline.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    inner: Mutex<MetricsSnapshot>,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MetricsSnapshot) -> R) -> R {
        let mut guard: MutexGuard<'_, MetricsSnapshot> = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with(|metrics| metrics.clone())
    }

    pub fn record_published(&self, platform: Platform) {
        self.with(|metrics| {
            let counter = metrics.published.entry(platform.to_string()).or_default();
            *counter = counter.saturating_add(1);
        });
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.with(|metrics| {
            let counter = metrics.failed.entry(kind.as_str().to_string()).or_default();
            *counter = counter.saturating_add(1);
            if kind == FailureKind::CircuitOpen {
                metrics.circuit_open_rejections = metrics.circuit_open_rejections.saturating_add(1);
            }
        });
    }

    pub fn record_api_publish(&self) {
        self.with(|metrics| metrics.api_publishes = metrics.api_publishes.saturating_add(1));
    }

    pub fn record_browser_fallback(&self) {
        self.with(|metrics| {
            metrics.browser_fallbacks = metrics.browser_fallbacks.saturating_add(1)
        });
    }

    pub fn record_page_opened(&self) {
        self.with(|metrics| metrics.pages_opened = metrics.pages_opened.saturating_add(1));
    }

    pub fn record_page_closed(&self) {
        self.with(|metrics| metrics.pages_closed = metrics.pages_closed.saturating_add(1));
    }

    pub fn record_page_leaked(&self) {
        self.with(|metrics| metrics.pages_leaked = metrics.pages_leaked.saturating_add(1));
    }

    pub fn record_sync(&self, upserted: usize) {
        self.with(|metrics| {
            metrics.sync_runs = metrics.sync_runs.saturating_add(1);
            metrics.posts_upserted = metrics.posts_upserted.saturating_add(upserted as u64);
        });
    }
}

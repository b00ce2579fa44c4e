use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::breaker::BreakerRegistry;
use crate::cover;
use crate::credentials::{CredentialError, CredentialResolver, PlatformCredential};
use crate::driver::{PublishDriver, PublishRequest};
use crate::failure::{FailureKind, PublishError, PublishResult};
use crate::ledger::{FailureLedger, FailureRecord, PublishChannel, RunRecord};
use crate::medium_api::MediumApiClient;
use crate::metrics::PipelineMetrics;
use crate::platform::Platform;
use crate::queue::{Delivery, HandlerError, MessageHandler, PublishTask, RETRY_COUNT_HEADER};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub url: Option<String>,
    pub channel: PublishChannel,
}

/// Summary of one attempt, for callers that report rather than react.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishOutcome {
    pub platform: Platform,
    pub success: bool,
    pub failure_kind: Option<FailureKind>,
    pub published_url: Option<String>,
}

impl PublishOutcome {
    pub fn from_result(platform: Platform, result: &PublishResult<Published>) -> Self {
        match result {
            Ok(published) => Self {
                platform,
                success: true,
                failure_kind: None,
                published_url: published.url.clone(),
            },
            Err(err) => Self {
                platform,
                success: false,
                failure_kind: Some(err.kind()),
                published_url: None,
            },
        }
    }
}

/// Handles `publish:post` messages: credentials, breaker gate, Medium API
/// shortcut, browser driver, then bookkeeping.
pub struct PublishService {
    resolver: CredentialResolver,
    breakers: Arc<BreakerRegistry>,
    driver: Arc<PublishDriver>,
    metrics: Arc<PipelineMetrics>,
    ledger: Option<Arc<FailureLedger>>,
    http: reqwest::Client,
    medium_api_base: Option<String>,
}

impl PublishService {
    pub fn new(
        resolver: CredentialResolver,
        breakers: Arc<BreakerRegistry>,
        driver: Arc<PublishDriver>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            resolver,
            breakers,
            driver,
            metrics,
            ledger: None,
            http: reqwest::Client::new(),
            medium_api_base: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<FailureLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Try Medium's editor API before the browser for cover-less posts.
    pub fn with_medium_api(mut self, base_url: impl Into<String>) -> Self {
        self.medium_api_base = Some(base_url.into());
        self
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Publishes and records the attempt in metrics and the ledger.
    pub async fn run(&self, task: &PublishTask, retry_count: u32) -> PublishResult<Published> {
        let started = Instant::now();
        let result = self.publish(task).await;
        match &result {
            Ok(published) => {
                self.metrics.record_published(task.platform);
                info!(
                    target: "publish",
                    platform = %task.platform,
                    user_id = task.user_id,
                    channel = published.channel.as_str(),
                    url = published.url.as_deref().unwrap_or(""),
                    "post published"
                );
                self.record_run(RunRecord {
                    timestamp: Utc::now(),
                    platform: task.platform,
                    user_id: task.user_id,
                    channel: published.channel,
                    duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
                    url: published.url.clone(),
                })
                .await;
            }
            Err(err) => {
                self.metrics.record_failure(err.kind());
                warn!(
                    target: "publish",
                    platform = %task.platform,
                    user_id = task.user_id,
                    kind = %err.kind(),
                    state = err.state().map(|state| state.as_str()).unwrap_or("-"),
                    retry_count,
                    error = %err,
                    "publish failed"
                );
                self.record_failure(FailureRecord {
                    timestamp: Utc::now(),
                    platform: task.platform,
                    user_id: task.user_id,
                    state: err.state(),
                    kind: err.kind(),
                    message: err.to_string(),
                    retry_count,
                    capture: err.capture().map(|path| path.to_path_buf()),
                })
                .await;
            }
        }
        result
    }

    pub async fn publish(&self, task: &PublishTask) -> PublishResult<Published> {
        validate(task)?;
        let credential = match self.resolver.resolve(task.user_id, task.platform).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                return Err(PublishError::CredentialsMissing {
                    platform: task.platform,
                    user_id: task.user_id,
                })
            }
            Err(CredentialError::Invalid { platform, reason }) => {
                return Err(PublishError::InvalidCredential { platform, reason })
            }
            Err(err) => {
                warn!(target: "publish", error = %err, "credential lookup failed");
                return Err(PublishError::CredentialsMissing {
                    platform: task.platform,
                    user_id: task.user_id,
                });
            }
        };

        let breaker = self.breakers.get(task.platform);
        breaker
            .execute(|| self.attempt(task, &credential))
            .await
    }

    async fn attempt(
        &self,
        task: &PublishTask,
        credential: &PlatformCredential,
    ) -> PublishResult<Published> {
        if task.platform == Platform::Medium && task.cover_image.is_none() {
            if let Some(base) = &self.medium_api_base {
                match self.publish_via_api(base, task, credential).await {
                    Some(url) => {
                        return Ok(Published {
                            url: Some(url),
                            channel: PublishChannel::Api,
                        })
                    }
                    None => self.metrics.record_browser_fallback(),
                }
            }
        }

        let cover = match &task.cover_image {
            Some(raw) => match cover::materialize(raw, &self.http).await {
                Ok(file) => Some(file),
                Err(err) => {
                    warn!(target: "publish", error = %err, "cover image unavailable; publishing without it");
                    None
                }
            },
            None => None,
        };
        let request = PublishRequest {
            title: task.title.clone(),
            content: task.content.clone(),
            tags: task.tags.clone(),
            cover_file: cover.as_ref().map(|file| file.path().to_path_buf()),
            blog_url: task.blog_url.clone(),
        };
        let receipt = self
            .driver
            .publish(task.platform, &credential.cookies(), &request)
            .await?;
        drop(cover);
        Ok(Published {
            url: receipt.url,
            channel: PublishChannel::Browser,
        })
    }

    async fn publish_via_api(
        &self,
        base: &str,
        task: &PublishTask,
        credential: &PlatformCredential,
    ) -> Option<String> {
        let client = match MediumApiClient::new(credential, base) {
            Ok(client) => client,
            Err(err) => {
                warn!(target: "publish", error = %err, "medium api client unavailable");
                return None;
            }
        };
        match client.publish(&task.title, &task.content, &task.tags).await {
            Ok(url) => {
                self.metrics.record_api_publish();
                Some(url)
            }
            Err(err) => {
                warn!(target: "publish", error = %err, "medium api publish failed; falling back to browser");
                None
            }
        }
    }

    async fn record_failure(&self, record: FailureRecord) {
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        match tokio::task::spawn_blocking(move || ledger.record_failure(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(target: "publish", error = %err, "failure ledger write failed"),
            Err(err) => warn!(target: "publish", error = %err, "failure ledger task failed"),
        }
    }

    async fn record_run(&self, record: RunRecord) {
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        match tokio::task::spawn_blocking(move || ledger.record_run(&record)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(target: "publish", error = %err, "run ledger write failed"),
            Err(err) => warn!(target: "publish", error = %err, "run ledger task failed"),
        }
    }

    async fn handle_body(&self, body: &[u8], retry_count: u32) -> Result<(), HandlerError> {
        let task = match PublishTask::decode(body) {
            Ok(task) => task,
            Err(err) => {
                self.metrics.record_failure(FailureKind::InvalidTask);
                warn!(target: "publish", error = %err, "undecodable publish task");
                return Err(Box::new(PublishError::InvalidTask(err.to_string())));
            }
        };
        self.run(&task, retry_count)
            .await
            .map(|_| ())
            .map_err(|err| Box::new(err) as HandlerError)
    }
}

#[async_trait]
impl MessageHandler for PublishService {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError> {
        self.handle_body(body, 0).await
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        let retry_count = delivery.headers.get_u32(RETRY_COUNT_HEADER).unwrap_or(0);
        self.handle_body(&delivery.body, retry_count).await
    }
}

fn validate(task: &PublishTask) -> PublishResult<()> {
    if task.content.trim().is_empty() {
        return Err(PublishError::InvalidTask("content is empty".into()));
    }
    if task.platform != Platform::LinkedIn && task.title.trim().is_empty() {
        return Err(PublishError::InvalidTask(format!(
            "{} posts need a title",
            task.platform
        )));
    }
    Ok(())
}

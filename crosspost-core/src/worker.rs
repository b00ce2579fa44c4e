//! Process assembly: builds every service from one config and runs the
//! publish and sync consumer pools until shutdown.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::breaker::BreakerRegistry;
use crate::browser::{BrowserSessionManager, SessionProvider};
use crate::config::{CrosspostConfig, WorkerSection};
use crate::credentials::{CredentialError, CredentialResolver, EnvFallback, SqliteCredentialStore};
use crate::driver::{DriverSettings, PublishDriver};
use crate::ledger::{FailureLedger, LedgerError};
use crate::metrics::PipelineMetrics;
use crate::publish::PublishService;
use crate::queue::{
    Broker, Consumer, ConsumerOptions, MessageHandler, QueueError, SqliteBroker,
};
use crate::sync::{SqlitePostStore, SyncError, SyncService, SyncSettings};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("credential store error: {0}")]
    Credential(#[from] CredentialError),
    #[error("post store error: {0}")]
    Sync(#[from] SyncError),
    #[error("failure ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

/// Every long-lived component of a worker process, wired from config.
pub struct Pipeline {
    pub broker: Arc<SqliteBroker>,
    pub browser: Arc<BrowserSessionManager>,
    pub metrics: Arc<PipelineMetrics>,
    pub breakers: Arc<BreakerRegistry>,
    pub ledger: Arc<FailureLedger>,
    pub credentials: Arc<SqliteCredentialStore>,
    pub publish: Arc<PublishService>,
    pub sync: Arc<SyncService>,
}

impl Pipeline {
    pub fn from_config(config: &CrosspostConfig) -> WorkerResult<Self> {
        let broker = Arc::new(SqliteBroker::open_path(&config.broker.path)?);
        let browser = Arc::new(BrowserSessionManager::new(config.browser.clone()));
        let sessions: Arc<dyn SessionProvider> = browser.clone();
        let metrics = Arc::new(PipelineMetrics::new());
        let breakers = Arc::new(BreakerRegistry::new(&config.breaker));
        let ledger = Arc::new(FailureLedger::new(
            &config.observability.failure_log,
            &config.observability.ledger_db,
        )?);
        let credentials = Arc::new(SqliteCredentialStore::open(&config.storage.credentials_db)?);
        let resolver = CredentialResolver::new(credentials.clone(), EnvFallback::from_process_env());

        let driver = Arc::new(PublishDriver::new(
            Arc::clone(&sessions),
            DriverSettings::from_config(config),
            Arc::clone(&metrics),
        ));
        let mut publish = PublishService::new(
            resolver.clone(),
            Arc::clone(&breakers),
            driver,
            Arc::clone(&metrics),
        )
        .with_ledger(Arc::clone(&ledger));
        if config.driver.medium_api_first {
            publish = publish.with_medium_api(config.driver.medium_api_base.clone());
        }

        let posts = Arc::new(SqlitePostStore::open(&config.storage.posts_db)?);
        let sync = SyncService::new(
            sessions,
            resolver,
            posts,
            Arc::clone(&metrics),
            SyncSettings::from_section(&config.sync),
        );

        Ok(Self {
            broker,
            browser,
            metrics,
            breakers,
            ledger,
            credentials,
            publish: Arc::new(publish),
            sync: Arc::new(sync),
        })
    }

    pub fn runtime(&self, config: &CrosspostConfig) -> WorkerRuntime {
        let publish: Arc<dyn MessageHandler> = self.publish.clone();
        let sync: Arc<dyn MessageHandler> = self.sync.clone();
        WorkerRuntime::new(
            self.broker.clone(),
            config.worker.clone(),
            ConsumerOptions::from_section(&config.broker),
            publish,
            sync,
        )
        .with_browser(Arc::clone(&self.browser))
    }
}

/// Fixed pools of publish and sync consumers. Each consumer holds at most
/// `prefetch` deliveries, which bounds concurrent browser work.
pub struct WorkerRuntime {
    broker: Arc<dyn Broker>,
    worker: WorkerSection,
    options: ConsumerOptions,
    publish: Arc<dyn MessageHandler>,
    sync: Arc<dyn MessageHandler>,
    browser: Option<Arc<BrowserSessionManager>>,
}

impl WorkerRuntime {
    pub fn new(
        broker: Arc<dyn Broker>,
        worker: WorkerSection,
        options: ConsumerOptions,
        publish: Arc<dyn MessageHandler>,
        sync: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            broker,
            worker,
            options,
            publish,
            sync,
            browser: None,
        }
    }

    /// Browser to shut down once every consumer has stopped.
    pub fn with_browser(mut self, browser: Arc<BrowserSessionManager>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        let recovered = self.broker.recover().await?;
        if recovered > 0 {
            info!(recovered, "returned unacknowledged deliveries to their queues");
        }

        let instance = Uuid::new_v4().simple().to_string();
        let mut consumers = JoinSet::new();
        let pools = [
            (
                "publish",
                &self.worker.publish_queue,
                self.worker.publish_workers,
                &self.publish,
            ),
            ("sync", &self.worker.sync_queue, self.worker.sync_workers, &self.sync),
        ];
        for (role, queue, count, handler) in pools {
            for index in 0..count {
                let consumer = Consumer::new(
                    Arc::clone(&self.broker),
                    queue.clone(),
                    format!("{role}-{index}-{}", &instance[..8]),
                    self.options.clone(),
                );
                let handler = Arc::clone(handler);
                let shutdown = shutdown.clone();
                consumers.spawn(async move {
                    let tag = consumer.consumer_tag().to_string();
                    (tag, consumer.run(handler, shutdown).await)
                });
            }
        }
        info!(
            publish_workers = self.worker.publish_workers,
            sync_workers = self.worker.sync_workers,
            "worker pool started"
        );

        while let Some(joined) = consumers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((tag, Err(err))) => warn!(consumer = %tag, error = %err, "consumer exited with error"),
                Err(err) => warn!(error = %err, "consumer task panicked"),
            }
        }

        if let Some(browser) = &self.browser {
            browser.shutdown().await;
        }
        info!("worker pool stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    use super::*;
    use crate::queue::{HandlerError, Producer};

    struct Counting {
        seen: AtomicUsize,
        done: Notify,
        expected: usize,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _body: &[u8]) -> Result<(), HandlerError> {
            if self.seen.fetch_add(1, Ordering::SeqCst) + 1 >= self.expected {
                self.done.notify_one();
            }
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pools_drain_their_queues_and_stop() {
        let dir = tempdir().unwrap();
        let broker: Arc<dyn Broker> =
            Arc::new(SqliteBroker::open_path(dir.path().join("broker.sqlite")).unwrap());
        let worker = WorkerSection {
            publish_workers: 3,
            sync_workers: 1,
            ..WorkerSection::default()
        };
        let options = ConsumerOptions {
            poll_interval: Duration::from_millis(10),
            ..ConsumerOptions::default()
        };
        let producer = Producer::new(Arc::clone(&broker), options.dead_letter_exchange.clone());
        for i in 0..6 {
            producer
                .publish(&worker.publish_queue, format!("{{\"n\":{i}}}").into_bytes())
                .await
                .unwrap();
        }
        producer
            .publish(&worker.sync_queue, b"{}".to_vec())
            .await
            .unwrap();

        let publish = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            done: Notify::new(),
            expected: 6,
        });
        let sync = Arc::new(Counting {
            seen: AtomicUsize::new(0),
            done: Notify::new(),
            expected: 1,
        });
        let runtime = WorkerRuntime::new(
            Arc::clone(&broker),
            worker,
            options,
            publish.clone(),
            sync.clone(),
        );
        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(async move { runtime.run(rx).await });

        tokio::time::timeout(Duration::from_secs(10), async {
            publish.done.notified().await;
            sync.done.notified().await;
        })
        .await
        .unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(publish.seen.load(Ordering::SeqCst), 6);
        assert_eq!(sync.seen.load(Ordering::SeqCst), 1);
    }
}

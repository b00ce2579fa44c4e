pub mod breaker;
pub mod browser;
pub mod config;
pub mod cover;
pub mod credentials;
pub mod driver;
pub mod error;
pub mod failure;
pub mod harvester;
pub mod ledger;
pub mod medium_api;
pub mod metrics;
pub mod platform;
pub mod publish;
pub mod queue;
pub mod sqlite;
pub mod sync;
pub mod worker;

pub use breaker::{BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitOpen, CircuitState};
pub use config::{load_config, CrosspostConfig};
pub use credentials::{
    CredentialError, CredentialMap, CredentialResolver, CredentialStore, EnvFallback,
    PlatformCredential, SqliteCredentialStore, StoredCredential,
};
pub use driver::{DriverSettings, PublishDriver, PublishReceipt, PublishRequest, PublishState};
pub use error::{ConfigError, Result};
pub use failure::{FailureKind, PublishError, PublishResult};
pub use harvester::{CredentialHarvester, HarvestError};
pub use ledger::{FailureLedger, FailureRecord, LedgerError, PublishChannel, RunRecord};
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use platform::Platform;
pub use publish::{PublishOutcome, PublishService, Published};
pub use queue::{
    Broker, Consumer, ConsumerOptions, MessageHandler, Producer, PublishTask, QueueError,
    SqliteBroker, SyncTask,
};
pub use sync::{PostStore, SqlitePostStore, SyncError, SyncReport, SyncService, UnifiedPost};
pub use worker::{Pipeline, WorkerError, WorkerRuntime};

//! Durable task queue: an AMQP-shaped broker plus the producer/consumer
//! pair that implements bounded retry and dead-lettering on top of it.

mod broker;
mod consumer;
mod task;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use broker::{
    Broker, Delivery, ExchangeKind, MessageHeaders, OutgoingMessage, QueueArguments, QueueStats,
    SqliteBroker, SqliteBrokerBuilder, StoredMessage, DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG, DEFAULT_EXCHANGE,
};
pub use consumer::{
    dead_letter_queue_name, declare_topology, Consumer, ConsumerOptions, DeliveryDisposition,
    HandlerError, MessageHandler, Producer, RETRY_COUNT_HEADER,
};
pub use task::{PublishTask, SyncTask, PUBLISH_QUEUE, SYNC_QUEUE};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to open broker database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on broker database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("broker path not configured")]
    MissingStore,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(i64),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("invalid exchange kind: {0}")]
    InvalidExchangeKind(String),
    #[error("message encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

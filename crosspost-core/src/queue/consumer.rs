use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::BrokerSection;

use super::broker::{
    Broker, Delivery, ExchangeKind, OutgoingMessage, QueueArguments, DEFAULT_EXCHANGE,
};
use super::QueueResult;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

pub type HandlerError = Box<dyn StdError + Send + Sync>;

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &[u8]) -> Result<(), HandlerError>;

    /// Handlers that care about headers (retry count, content type)
    /// override this; the default only looks at the body.
    async fn handle_delivery(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        self.handle(&delivery.body).await
    }
}

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{queue}:dlq")
}

/// Declares the dead-letter exchange, `<queue>:dlq` bound to it with the
/// queue's name as routing key, and the queue itself pointing at both.
pub async fn declare_topology(
    broker: &dyn Broker,
    queue: &str,
    dead_letter_exchange: &str,
) -> QueueResult<()> {
    let dlq = dead_letter_queue_name(queue);
    broker
        .declare_exchange(dead_letter_exchange, ExchangeKind::Direct)
        .await?;
    broker.declare_queue(&dlq, &QueueArguments::default()).await?;
    broker.bind_queue(&dlq, queue, dead_letter_exchange).await?;
    broker
        .declare_queue(
            queue,
            &QueueArguments::with_dead_letter(dead_letter_exchange, queue),
        )
        .await
}

#[derive(Clone)]
pub struct Producer {
    broker: Arc<dyn Broker>,
    dead_letter_exchange: String,
}

impl Producer {
    pub fn new(broker: Arc<dyn Broker>, dead_letter_exchange: impl Into<String>) -> Self {
        Self {
            broker,
            dead_letter_exchange: dead_letter_exchange.into(),
        }
    }

    pub async fn publish(&self, queue: &str, payload: Vec<u8>) -> QueueResult<()> {
        declare_topology(self.broker.as_ref(), queue, &self.dead_letter_exchange).await?;
        self.broker
            .publish(DEFAULT_EXCHANGE, queue, OutgoingMessage::json(payload))
            .await?;
        debug!(queue, "message published");
        Ok(())
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, queue: &str, value: &T) -> QueueResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.publish(queue, payload).await
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub dead_letter_exchange: String,
    pub prefetch: u32,
    pub max_retries: u32,
    pub poll_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self::from_section(&BrokerSection::default())
    }
}

impl ConsumerOptions {
    pub fn from_section(section: &BrokerSection) -> Self {
        Self {
            dead_letter_exchange: section.dead_letter_exchange.clone(),
            prefetch: section.prefetch,
            max_retries: section.max_retries,
            poll_interval: section.poll_interval(),
        }
    }
}

/// What happened to one delivery after the handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryDisposition {
    Acked,
    Retried { retry_count: u32 },
    Requeued,
    DeadLettered,
}

pub struct Consumer {
    broker: Arc<dyn Broker>,
    queue: String,
    consumer_tag: String,
    options: ConsumerOptions,
}

impl Consumer {
    pub fn new(
        broker: Arc<dyn Broker>,
        queue: impl Into<String>,
        consumer_tag: impl Into<String>,
        options: ConsumerOptions,
    ) -> Self {
        Self {
            broker,
            queue: queue.into(),
            consumer_tag: consumer_tag.into(),
            options,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub async fn declare(&self) -> QueueResult<()> {
        declare_topology(
            self.broker.as_ref(),
            &self.queue,
            &self.options.dead_letter_exchange,
        )
        .await
    }

    /// Takes at most one delivery, runs the handler, then settles it.
    /// Returns `None` when nothing was available for this consumer.
    pub async fn process_next(
        &self,
        handler: &dyn MessageHandler,
    ) -> QueueResult<Option<DeliveryDisposition>> {
        let Some(delivery) = self
            .broker
            .fetch(&self.queue, &self.consumer_tag, self.options.prefetch)
            .await?
        else {
            return Ok(None);
        };
        let tag = delivery.delivery_tag;
        debug!(queue = %self.queue, delivery_tag = tag, "message received");

        let error = match handler.handle_delivery(&delivery).await {
            Ok(()) => {
                self.broker.ack(tag).await?;
                info!(queue = %self.queue, delivery_tag = tag, "message processed");
                return Ok(Some(DeliveryDisposition::Acked));
            }
            Err(error) => error,
        };

        let retry_count = delivery.headers.get_u32(RETRY_COUNT_HEADER).unwrap_or(0);
        warn!(queue = %self.queue, delivery_tag = tag, retry_count, error = %error, "message handler failed");

        if retry_count >= self.options.max_retries {
            self.broker.nack(tag, false).await?;
            warn!(queue = %self.queue, delivery_tag = tag, "retries exhausted, dead-lettering");
            return Ok(Some(DeliveryDisposition::DeadLettered));
        }

        let next = retry_count + 1;
        let mut retry = OutgoingMessage {
            body: delivery.body,
            headers: delivery.headers,
            content_type: delivery.content_type,
        };
        retry.headers.insert(RETRY_COUNT_HEADER, next);
        match self
            .broker
            .publish(DEFAULT_EXCHANGE, &self.queue, retry)
            .await
        {
            Ok(_) => {
                self.broker.ack(tag).await?;
                info!(queue = %self.queue, retry_count = next, max = self.options.max_retries, "message scheduled for retry");
                Ok(Some(DeliveryDisposition::Retried { retry_count: next }))
            }
            Err(err) => {
                warn!(queue = %self.queue, error = %err, "republish failed, requeueing original");
                self.broker.nack(tag, true).await?;
                Ok(Some(DeliveryDisposition::Requeued))
            }
        }
    }

    /// Consumes until the shutdown signal flips to `true`. Broker errors are
    /// logged and retried after the poll interval.
    pub async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> QueueResult<()> {
        self.declare().await?;
        info!(queue = %self.queue, consumer = %self.consumer_tag, "consumer started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.process_next(handler.as_ref()).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    warn!(queue = %self.queue, consumer = %self.consumer_tag, error = %err, "consume iteration failed");
                }
            }
            tokio::select! {
                _ = sleep(self.options.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(queue = %self.queue, consumer = %self.consumer_tag, "consumer stopped");
        Ok(())
    }
}

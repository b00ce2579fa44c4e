use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::{write::GzEncoder, Compression};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::sqlite::configure_connection;

use super::{QueueError, QueueResult};

const BROKER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS broker_exchanges (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS broker_queues (
    name TEXT PRIMARY KEY,
    dead_letter_exchange TEXT,
    dead_letter_routing_key TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS broker_bindings (
    exchange TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    queue TEXT NOT NULL,
    PRIMARY KEY (exchange, routing_key, queue)
);

CREATE TABLE IF NOT EXISTS broker_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue TEXT NOT NULL,
    routing_key TEXT NOT NULL,
    body BLOB NOT NULL,
    headers TEXT NOT NULL DEFAULT '{}',
    content_type TEXT,
    state TEXT NOT NULL DEFAULT 'ready',
    consumer_tag TEXT,
    redelivered INTEGER NOT NULL DEFAULT 0,
    delivery_count INTEGER NOT NULL DEFAULT 0,
    published_at TEXT NOT NULL,
    delivered_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_broker_messages_ready
    ON broker_messages (queue, state, id);
"#;

/// The nameless exchange routes straight to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl std::str::FromStr for ExchangeKind {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            other => Err(QueueError::InvalidExchangeKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueArguments {
    pub fn with_dead_letter(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            dead_letter_exchange: Some(exchange.into()),
            dead_letter_routing_key: Some(routing_key.into()),
        }
    }
}

/// String-keyed message headers, serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHeaders(BTreeMap<String, Value>);

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Reads an integer header, accepting numeric strings as some publishers send them.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.0.get(key)? {
            Value::Number(number) => number.as_u64().and_then(|value| u32::try_from(value).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
    pub content_type: Option<String>,
}

impl OutgoingMessage {
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            headers: MessageHeaders::new(),
            content_type: Some("application/json".into()),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key, value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: i64,
    pub queue: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: MessageHeaders,
    pub content_type: Option<String>,
    pub redelivered: bool,
}

/// AMQP-shaped operations the producer and consumer need from a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> QueueResult<()>;

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> QueueResult<()>;

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> QueueResult<()>;

    /// Returns how many queues received a copy.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> QueueResult<usize>;

    /// Hands out the oldest ready message unless the consumer already holds
    /// `prefetch` unacknowledged deliveries.
    async fn fetch(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u32,
    ) -> QueueResult<Option<Delivery>>;

    async fn ack(&self, delivery_tag: i64) -> QueueResult<()>;

    async fn nack(&self, delivery_tag: i64, requeue: bool) -> QueueResult<()>;

    /// Returns every unacknowledged delivery to the ready state.
    async fn recover(&self) -> QueueResult<usize>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub ready: i64,
    pub unacked: i64,
    pub dead_letter_exchange: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub queue: String,
    pub routing_key: String,
    pub state: String,
    pub headers: MessageHeaders,
    pub body: String,
    pub redelivered: bool,
    pub delivery_count: i64,
    pub published_at: DateTime<Utc>,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let body: Vec<u8> = row.get("body")?;
        let headers: String = row.get("headers")?;
        Ok(Self {
            id: row.get("id")?,
            queue: row.get("queue")?,
            routing_key: row.get("routing_key")?,
            state: row.get("state")?,
            headers: serde_json::from_str(&headers).unwrap_or_default(),
            body: String::from_utf8_lossy(&body).into_owned(),
            redelivered: row.get::<_, i64>("redelivered")? != 0,
            delivery_count: row.get("delivery_count")?,
            published_at: row.get("published_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteBrokerBuilder {
    path: Option<PathBuf>,
    read_only: bool,
}

impl Default for SqliteBrokerBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
        }
    }
}

impl SqliteBrokerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn build(self) -> QueueResult<SqliteBroker> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        let flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        };
        let broker = SqliteBroker { path, flags };
        if !self.read_only {
            broker.initialize()?;
        }
        Ok(broker)
    }
}

/// Durable broker backed by a single SQLite file. Every message is persistent.
#[derive(Debug, Clone)]
pub struct SqliteBroker {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteBroker {
    pub fn builder() -> SqliteBrokerBuilder {
        SqliteBrokerBuilder::new()
    }

    pub fn open_path(path: impl AsRef<Path>) -> QueueResult<Self> {
        SqliteBrokerBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> QueueResult<Connection> {
        if self.flags.contains(OpenFlags::SQLITE_OPEN_CREATE) {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            QueueError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| QueueError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> QueueResult<()> {
        let conn = self.open()?;
        conn.execute_batch(BROKER_SCHEMA)?;
        Ok(())
    }

    fn declare_exchange_blocking(&self, name: &str, kind: ExchangeKind) -> QueueResult<()> {
        if name == DEFAULT_EXCHANGE {
            return Ok(());
        }
        let conn = self.open()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT kind FROM broker_exchanges WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(current) if current != kind.as_str() => Err(QueueError::PreconditionFailed(
                format!("exchange {name} already declared as {current}"),
            )),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO broker_exchanges (name, kind, created_at) VALUES (?1, ?2, ?3)",
                    params![name, kind.as_str(), Utc::now()],
                )?;
                Ok(())
            }
        }
    }

    fn declare_queue_blocking(&self, name: &str, arguments: &QueueArguments) -> QueueResult<()> {
        let conn = self.open()?;
        let existing = conn
            .query_row(
                "SELECT dead_letter_exchange, dead_letter_routing_key FROM broker_queues WHERE name = ?1",
                [name],
                |row| {
                    Ok(QueueArguments {
                        dead_letter_exchange: row.get(0)?,
                        dead_letter_routing_key: row.get(1)?,
                    })
                },
            )
            .optional()?;
        match existing {
            Some(current) if current != *arguments => Err(QueueError::PreconditionFailed(
                format!("queue {name} already declared with different arguments"),
            )),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO broker_queues (name, dead_letter_exchange, dead_letter_routing_key, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        name,
                        arguments.dead_letter_exchange,
                        arguments.dead_letter_routing_key,
                        Utc::now()
                    ],
                )?;
                Ok(())
            }
        }
    }

    fn bind_queue_blocking(&self, queue: &str, routing_key: &str, exchange: &str) -> QueueResult<()> {
        let conn = self.open()?;
        ensure_queue_exists(&conn, queue)?;
        let exchange_known: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM broker_exchanges WHERE name = ?1)",
                [exchange],
                |row| row.get(0),
            )?;
        if !exchange_known {
            return Err(QueueError::NotFound(format!("exchange {exchange}")));
        }
        conn.execute(
            "INSERT OR IGNORE INTO broker_bindings (exchange, routing_key, queue) VALUES (?1, ?2, ?3)",
            params![exchange, routing_key, queue],
        )?;
        Ok(())
    }

    fn publish_blocking(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> QueueResult<usize> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let targets = route(&tx, exchange, routing_key)?;
        let headers = serde_json::to_string(&message.headers)?;
        let now = Utc::now();
        for queue in &targets {
            tx.execute(
                "INSERT INTO broker_messages (queue, routing_key, body, headers, content_type, published_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![queue, routing_key, message.body, headers, message.content_type, now],
            )?;
        }
        tx.commit()?;
        if targets.is_empty() {
            warn!(exchange, routing_key, "message unroutable, dropped");
        }
        Ok(targets.len())
    }

    fn fetch_blocking(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u32,
    ) -> QueueResult<Option<Delivery>> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_queue_exists(&tx, queue)?;
        let in_flight: i64 = tx.query_row(
            "SELECT COUNT(*) FROM broker_messages WHERE queue = ?1 AND consumer_tag = ?2 AND state = 'unacked'",
            params![queue, consumer_tag],
            |row| row.get(0),
        )?;
        if prefetch > 0 && in_flight >= i64::from(prefetch) {
            tx.commit()?;
            return Ok(None);
        }
        let candidate = tx
            .query_row(
                "SELECT id, routing_key, body, headers, content_type, redelivered
                 FROM broker_messages WHERE queue = ?1 AND state = 'ready'
                 ORDER BY id LIMIT 1",
                [queue],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, routing_key, body, headers, content_type, redelivered)) = candidate else {
            tx.commit()?;
            return Ok(None);
        };
        tx.execute(
            "UPDATE broker_messages
             SET state = 'unacked', consumer_tag = ?1, delivered_at = ?2, delivery_count = delivery_count + 1
             WHERE id = ?3",
            params![consumer_tag, Utc::now(), id],
        )?;
        tx.commit()?;
        Ok(Some(Delivery {
            delivery_tag: id,
            queue: queue.to_string(),
            routing_key,
            body,
            headers: serde_json::from_str(&headers)?,
            content_type,
            redelivered: redelivered != 0,
        }))
    }

    fn ack_blocking(&self, delivery_tag: i64) -> QueueResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "DELETE FROM broker_messages WHERE id = ?1 AND state = 'unacked'",
            [delivery_tag],
        )?;
        if affected == 0 {
            return Err(QueueError::UnknownDelivery(delivery_tag));
        }
        Ok(())
    }

    fn nack_blocking(&self, delivery_tag: i64, requeue: bool) -> QueueResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row = tx
            .query_row(
                "SELECT m.queue, m.routing_key, m.body, m.headers, m.content_type,
                        q.dead_letter_exchange, q.dead_letter_routing_key
                 FROM broker_messages m LEFT JOIN broker_queues q ON q.name = m.queue
                 WHERE m.id = ?1 AND m.state = 'unacked'",
                [delivery_tag],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((queue, routing_key, body, headers, content_type, dlx, dlx_key)) = row else {
            return Err(QueueError::UnknownDelivery(delivery_tag));
        };

        if requeue {
            tx.execute(
                "UPDATE broker_messages SET state = 'ready', consumer_tag = NULL, redelivered = 1 WHERE id = ?1",
                [delivery_tag],
            )?;
            tx.commit()?;
            return Ok(());
        }

        tx.execute("DELETE FROM broker_messages WHERE id = ?1", [delivery_tag])?;
        match dlx {
            Some(exchange) => {
                let dead_key = dlx_key.unwrap_or(routing_key);
                let mut headers: MessageHeaders = serde_json::from_str(&headers)?;
                headers.insert("x-first-death-queue", queue.clone());
                headers.insert("x-first-death-reason", "rejected");
                headers.insert("x-first-death-exchange", exchange.clone());
                let headers = serde_json::to_string(&headers)?;
                let targets = route(&tx, &exchange, &dead_key)?;
                let now = Utc::now();
                for target in &targets {
                    tx.execute(
                        "INSERT INTO broker_messages (queue, routing_key, body, headers, content_type, published_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![target, dead_key, body, headers, content_type, now],
                    )?;
                }
                if targets.is_empty() {
                    warn!(queue = %queue, exchange = %exchange, routing_key = %dead_key, "dead letter unroutable, dropped");
                } else {
                    debug!(queue = %queue, targets = ?targets, "message dead-lettered");
                }
            }
            None => warn!(queue = %queue, "rejected message has no dead-letter exchange, dropped"),
        }
        tx.commit()?;
        Ok(())
    }

    fn recover_blocking(&self) -> QueueResult<usize> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE broker_messages SET state = 'ready', consumer_tag = NULL, redelivered = 1 WHERE state = 'unacked'",
            [],
        )?;
        Ok(affected)
    }

    pub fn queue_stats(&self) -> QueueResult<Vec<QueueStats>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT q.name, q.dead_letter_exchange,
                    COALESCE(SUM(CASE WHEN m.state = 'ready' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN m.state = 'unacked' THEN 1 ELSE 0 END), 0)
             FROM broker_queues q LEFT JOIN broker_messages m ON m.queue = q.name
             GROUP BY q.name ORDER BY q.name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(QueueStats {
                name: row.get(0)?,
                dead_letter_exchange: row.get(1)?,
                ready: row.get(2)?,
                unacked: row.get(3)?,
            })
        })?;
        let mut stats = Vec::new();
        for row in rows {
            stats.push(row?);
        }
        Ok(stats)
    }

    pub fn list_messages(&self, queue: &str, limit: Option<usize>) -> QueueResult<Vec<StoredMessage>> {
        let conn = self.open()?;
        let limit = limit.map(|value| value as i64).unwrap_or(-1);
        let mut stmt = conn.prepare(
            "SELECT * FROM broker_messages WHERE queue = ?1 ORDER BY id LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![queue, limit])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(StoredMessage::from_row(row)?);
        }
        Ok(messages)
    }

    /// Writes every message of `queue` as gzip-compressed JSON lines.
    pub fn export_queue(&self, queue: &str, output: impl AsRef<Path>) -> QueueResult<usize> {
        let output = output.as_ref();
        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let messages = self.list_messages(queue, None)?;
        let file = File::create(output)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        for message in &messages {
            serde_json::to_writer(&mut encoder, message)?;
            encoder.write_all(b"\n")?;
        }
        encoder.finish()?;
        Ok(messages.len())
    }

    async fn blocking<T, F>(&self, task: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqliteBroker) -> QueueResult<T> + Send + 'static,
    {
        let broker = self.clone();
        tokio::task::spawn_blocking(move || task(broker))
            .await
            .map_err(|err| QueueError::Io(io::Error::other(err)))?
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> QueueResult<()> {
        let name = name.to_string();
        self.blocking(move |broker| broker.declare_exchange_blocking(&name, kind))
            .await
    }

    async fn declare_queue(&self, name: &str, arguments: &QueueArguments) -> QueueResult<()> {
        let name = name.to_string();
        let arguments = arguments.clone();
        self.blocking(move |broker| broker.declare_queue_blocking(&name, &arguments))
            .await
    }

    async fn bind_queue(&self, queue: &str, routing_key: &str, exchange: &str) -> QueueResult<()> {
        let (queue, routing_key, exchange) =
            (queue.to_string(), routing_key.to_string(), exchange.to_string());
        self.blocking(move |broker| broker.bind_queue_blocking(&queue, &routing_key, &exchange))
            .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> QueueResult<usize> {
        let (exchange, routing_key) = (exchange.to_string(), routing_key.to_string());
        self.blocking(move |broker| broker.publish_blocking(&exchange, &routing_key, &message))
            .await
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u32,
    ) -> QueueResult<Option<Delivery>> {
        let (queue, consumer_tag) = (queue.to_string(), consumer_tag.to_string());
        self.blocking(move |broker| broker.fetch_blocking(&queue, &consumer_tag, prefetch))
            .await
    }

    async fn ack(&self, delivery_tag: i64) -> QueueResult<()> {
        self.blocking(move |broker| broker.ack_blocking(delivery_tag))
            .await
    }

    async fn nack(&self, delivery_tag: i64, requeue: bool) -> QueueResult<()> {
        self.blocking(move |broker| broker.nack_blocking(delivery_tag, requeue))
            .await
    }

    async fn recover(&self) -> QueueResult<usize> {
        self.blocking(|broker| broker.recover_blocking()).await
    }
}

fn ensure_queue_exists(conn: &Connection, queue: &str) -> QueueResult<()> {
    let known: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM broker_queues WHERE name = ?1)",
        [queue],
        |row| row.get(0),
    )?;
    if known {
        Ok(())
    } else {
        Err(QueueError::NotFound(format!("queue {queue}")))
    }
}

fn route(conn: &Connection, exchange: &str, routing_key: &str) -> QueueResult<Vec<String>> {
    if exchange == DEFAULT_EXCHANGE {
        let known: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM broker_queues WHERE name = ?1)",
            [routing_key],
            |row| row.get(0),
        )?;
        return Ok(if known {
            vec![routing_key.to_string()]
        } else {
            Vec::new()
        });
    }
    let kind: Option<String> = conn
        .query_row(
            "SELECT kind FROM broker_exchanges WHERE name = ?1",
            [exchange],
            |row| row.get(0),
        )
        .optional()?;
    let Some(kind) = kind else {
        return Err(QueueError::NotFound(format!("exchange {exchange}")));
    };
    let kind: ExchangeKind = kind.parse()?;
    let mut stmt = match kind {
        ExchangeKind::Direct => conn.prepare(
            "SELECT DISTINCT queue FROM broker_bindings WHERE exchange = ?1 AND routing_key = ?2 ORDER BY queue",
        )?,
        ExchangeKind::Fanout => conn.prepare(
            "SELECT DISTINCT queue FROM broker_bindings WHERE exchange = ?1 AND ?2 IS NOT NULL ORDER BY queue",
        )?,
    };
    let rows = stmt.query_map(params![exchange, routing_key], |row| row.get::<_, String>(0))?;
    let mut queues = Vec::new();
    for row in rows {
        queues.push(row?);
    }
    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn broker() -> (tempfile::TempDir, SqliteBroker) {
        let dir = tempdir().unwrap();
        let broker = SqliteBroker::open_path(dir.path().join("broker.sqlite")).unwrap();
        (dir, broker)
    }

    #[tokio::test]
    async fn prefetch_limits_in_flight_deliveries() {
        let (_dir, broker) = broker();
        broker
            .declare_queue("jobs", &QueueArguments::default())
            .await
            .unwrap();
        for body in ["a", "b"] {
            broker
                .publish(DEFAULT_EXCHANGE, "jobs", OutgoingMessage::json(body.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        let first = broker.fetch("jobs", "c1", 1).await.unwrap().unwrap();
        assert_eq!(first.body, b"a");
        assert!(broker.fetch("jobs", "c1", 1).await.unwrap().is_none());

        let second = broker.fetch("jobs", "c2", 1).await.unwrap().unwrap();
        assert_eq!(second.body, b"b");

        broker.ack(first.delivery_tag).await.unwrap();
        assert!(broker.fetch("jobs", "c1", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_ack_is_rejected() {
        let (_dir, broker) = broker();
        broker
            .declare_queue("jobs", &QueueArguments::default())
            .await
            .unwrap();
        broker
            .publish(DEFAULT_EXCHANGE, "jobs", OutgoingMessage::json(b"{}".to_vec()))
            .await
            .unwrap();
        let delivery = broker.fetch("jobs", "c1", 1).await.unwrap().unwrap();
        broker.ack(delivery.delivery_tag).await.unwrap();
        assert!(matches!(
            broker.ack(delivery.delivery_tag).await,
            Err(QueueError::UnknownDelivery(_))
        ));
    }

    #[tokio::test]
    async fn reject_routes_through_dead_letter_exchange() {
        let (_dir, broker) = broker();
        broker.declare_exchange("dlx", ExchangeKind::Direct).await.unwrap();
        broker
            .declare_queue("jobs:dlq", &QueueArguments::default())
            .await
            .unwrap();
        broker.bind_queue("jobs:dlq", "jobs", "dlx").await.unwrap();
        broker
            .declare_queue("jobs", &QueueArguments::with_dead_letter("dlx", "jobs"))
            .await
            .unwrap();
        broker
            .publish(DEFAULT_EXCHANGE, "jobs", OutgoingMessage::json(b"{}".to_vec()))
            .await
            .unwrap();

        let delivery = broker.fetch("jobs", "c1", 1).await.unwrap().unwrap();
        broker.nack(delivery.delivery_tag, false).await.unwrap();

        assert!(broker.fetch("jobs", "c1", 1).await.unwrap().is_none());
        let dead = broker.list_messages("jobs:dlq", None).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(
            dead[0].headers.get("x-first-death-queue"),
            Some(&Value::from("jobs"))
        );
    }

    #[tokio::test]
    async fn requeue_marks_message_redelivered() {
        let (_dir, broker) = broker();
        broker
            .declare_queue("jobs", &QueueArguments::default())
            .await
            .unwrap();
        broker
            .publish(DEFAULT_EXCHANGE, "jobs", OutgoingMessage::json(b"{}".to_vec()))
            .await
            .unwrap();
        let delivery = broker.fetch("jobs", "c1", 1).await.unwrap().unwrap();
        assert!(!delivery.redelivered);
        broker.nack(delivery.delivery_tag, true).await.unwrap();
        let again = broker.fetch("jobs", "c1", 1).await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_eq!(again.delivery_tag, delivery.delivery_tag);
    }

    #[tokio::test]
    async fn recover_releases_unacked_messages() {
        let (_dir, broker) = broker();
        broker
            .declare_queue("jobs", &QueueArguments::default())
            .await
            .unwrap();
        broker
            .publish(DEFAULT_EXCHANGE, "jobs", OutgoingMessage::json(b"{}".to_vec()))
            .await
            .unwrap();
        broker.fetch("jobs", "dead-consumer", 1).await.unwrap().unwrap();
        assert_eq!(broker.recover().await.unwrap(), 1);
        assert!(broker.fetch("jobs", "c2", 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn redeclaring_with_other_arguments_fails() {
        let (_dir, broker) = broker();
        broker
            .declare_queue("jobs", &QueueArguments::default())
            .await
            .unwrap();
        let err = broker
            .declare_queue("jobs", &QueueArguments::with_dead_letter("dlx", "jobs"))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::PreconditionFailed(_)));
    }

    #[test]
    fn export_writes_gzip_json_lines() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let (dir, broker) = broker();
        broker
            .declare_queue_blocking("jobs", &QueueArguments::default())
            .unwrap();
        broker
            .publish_blocking(DEFAULT_EXCHANGE, "jobs", &OutgoingMessage::json(b"{\"a\":1}".to_vec()))
            .unwrap();
        let output = dir.path().join("export/jobs.jsonl.gz");
        assert_eq!(broker.export_queue("jobs", &output).unwrap(), 1);

        let mut text = String::new();
        GzDecoder::new(File::open(&output).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        let line: Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(line["body"], "{\"a\":1}");
        assert_eq!(line["queue"], "jobs");
    }
}

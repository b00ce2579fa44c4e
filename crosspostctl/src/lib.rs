use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crosspost_core::browser::{BrowserSessionManager, SessionProvider};
use crosspost_core::queue::{dead_letter_queue_name, QueueStats, StoredMessage};
use crosspost_core::{
    load_config, CredentialHarvester, CredentialMap, CredentialStore, CrosspostConfig,
    FailureLedger, FailureRecord, Pipeline, PipelineMetrics, Platform, PlatformCredential,
    Producer, PublishTask, SqliteBroker, SqliteCredentialStore, SyncReport, SyncTask,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] crosspost_core::ConfigError),
    #[error("queue error: {0}")]
    Queue(#[from] crosspost_core::QueueError),
    #[error("credential error: {0}")]
    Credential(#[from] crosspost_core::CredentialError),
    #[error("login failed: {0}")]
    Harvest(#[from] crosspost_core::HarvestError),
    #[error("sync failed: {0}")]
    Sync(#[from] crosspost_core::SyncError),
    #[error("ledger error: {0}")]
    Ledger(#[from] crosspost_core::LedgerError),
    #[error("worker error: {0}")]
    Worker(#[from] crosspost_core::WorkerError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Cross-posting worker and operator interface", long_about = None)]
pub struct Cli {
    /// Path to crosspost.toml
    #[arg(long, default_value = "configs/crosspost.toml")]
    pub config: PathBuf,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the publish and sync consumer pools until Ctrl-C
    Worker,
    /// Enqueue a publish task
    Publish(PublishArgs),
    /// Enqueue (or run inline) a dashboard sync
    Sync(SyncArgs),
    /// Manage stored platform sessions
    #[command(subcommand)]
    Credentials(CredentialCommands),
    /// Inspect broker queues
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Inspect dead-letter queues
    #[command(subcommand)]
    Dlq(DlqCommands),
    /// List recent publish failures from the ledger
    Failures(FailuresArgs),
    /// Check config and local databases
    Health,
}

#[derive(Args, Debug)]
pub struct PublishArgs {
    #[arg(long)]
    pub user: i64,
    #[arg(long)]
    pub platform: Platform,
    #[arg(long, default_value = "")]
    pub title: String,
    /// Post body; mutually exclusive with --content-file
    #[arg(long, conflicts_with = "content_file")]
    pub content: Option<String>,
    #[arg(long)]
    pub content_file: Option<PathBuf>,
    /// Repeat for several tags
    #[arg(long = "tag")]
    pub tags: Vec<String>,
    /// data: URL, http(s) URL or local path
    #[arg(long)]
    pub cover: Option<String>,
    #[arg(long)]
    pub blog_url: Option<String>,
}

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[arg(long)]
    pub user: i64,
    #[arg(long)]
    pub platform: Platform,
    /// Scrape in this process instead of enqueueing
    #[arg(long, default_value_t = false)]
    pub now: bool,
}

#[derive(Subcommand, Debug)]
pub enum CredentialCommands {
    /// Store a session from key=value pairs
    Set(CredentialSetArgs),
    /// Sign in through a visible browser and store the resulting session
    Login(CredentialLoginArgs),
}

#[derive(Args, Debug)]
pub struct CredentialSetArgs {
    #[arg(long)]
    pub user: i64,
    #[arg(long)]
    pub platform: Platform,
    /// Cookie values, e.g. uid=... sid=...
    #[arg(required = true, value_name = "KEY=VALUE")]
    pub values: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CredentialLoginArgs {
    #[arg(long)]
    pub user: i64,
    #[arg(long)]
    pub platform: Platform,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Ready and unacked counts per queue
    Stats,
}

#[derive(Subcommand, Debug)]
pub enum DlqCommands {
    /// List dead-lettered messages
    Show(DlqShowArgs),
    /// Write dead-lettered messages as gzip JSON lines
    Export(DlqExportArgs),
}

#[derive(Args, Debug)]
pub struct DlqShowArgs {
    /// Source queue; its `:dlq` companion is read
    #[arg(long, default_value = "publish:post")]
    pub queue: String,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct DlqExportArgs {
    #[arg(long, default_value = "publish:post")]
    pub queue: String,
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct FailuresArgs {
    #[arg(long)]
    pub platform: Option<Platform>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::load(&cli.config)?;

    match &cli.command {
        Commands::Worker => context.run_worker().await?,
        Commands::Publish(args) => {
            let enqueued = context.enqueue_publish(args).await?;
            render(&enqueued, cli.format)?;
        }
        Commands::Sync(args) if args.now => {
            let report = context.sync_now(args).await?;
            render(&SyncSummary(report), cli.format)?;
        }
        Commands::Sync(args) => {
            let enqueued = context.enqueue_sync(args).await?;
            render(&enqueued, cli.format)?;
        }
        Commands::Credentials(CredentialCommands::Set(args)) => {
            let saved = context.set_credentials(args).await?;
            render(&saved, cli.format)?;
        }
        Commands::Credentials(CredentialCommands::Login(args)) => {
            let saved = context.login(args).await?;
            render(&saved, cli.format)?;
        }
        Commands::Queue(QueueCommands::Stats) => {
            let stats = context.queue_stats()?;
            render(&stats, cli.format)?;
        }
        Commands::Dlq(DlqCommands::Show(args)) => {
            let dead = context.dlq_show(args)?;
            render(&dead, cli.format)?;
        }
        Commands::Dlq(DlqCommands::Export(args)) => {
            let exported = context.dlq_export(args)?;
            render(&exported, cli.format)?;
        }
        Commands::Failures(args) => {
            let failures = context.failures(args)?;
            render(&failures, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    config_path: PathBuf,
    config: CrosspostConfig,
}

impl AppContext {
    pub fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            config_path: path.to_path_buf(),
            config,
        })
    }

    pub fn from_config(config_path: impl Into<PathBuf>, config: CrosspostConfig) -> Self {
        Self {
            config_path: config_path.into(),
            config,
        }
    }

    async fn run_worker(&self) -> Result<()> {
        let pipeline = Pipeline::from_config(&self.config)?;
        let runtime = pipeline.runtime(&self.config);
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received, draining consumers"),
                Err(err) => warn!(error = %err, "cannot listen for Ctrl-C; stopping"),
            }
            let _ = tx.send(true);
        });
        runtime.run(rx).await?;
        Ok(())
    }

    fn producer(&self) -> Result<Producer> {
        let broker = Arc::new(SqliteBroker::open_path(&self.config.broker.path)?);
        Ok(Producer::new(
            broker,
            self.config.broker.dead_letter_exchange.clone(),
        ))
    }

    async fn enqueue_publish(&self, args: &PublishArgs) -> Result<Enqueued> {
        let content = match (&args.content, &args.content_file) {
            (Some(content), _) => content.clone(),
            (None, Some(path)) => fs::read_to_string(path)?,
            (None, None) => {
                return Err(AppError::InvalidArgument(
                    "one of --content or --content-file is required".into(),
                ))
            }
        };
        if content.trim().is_empty() {
            return Err(AppError::InvalidArgument("post content is empty".into()));
        }
        let task = PublishTask {
            user_id: args.user,
            platform: args.platform,
            title: args.title.clone(),
            content,
            cover_image: args.cover.clone(),
            tags: args.tags.clone(),
            blog_url: args.blog_url.clone(),
        };
        let queue = self.config.worker.publish_queue.clone();
        self.producer()?.publish(&queue, task.encode()?).await?;
        info!(queue = %queue, user_id = args.user, platform = %args.platform, "publish task enqueued");
        Ok(Enqueued {
            queue,
            user_id: args.user,
            platform: args.platform,
        })
    }

    async fn enqueue_sync(&self, args: &SyncArgs) -> Result<Enqueued> {
        let task = SyncTask {
            user_id: args.user,
            platform: args.platform,
        };
        let queue = self.config.worker.sync_queue.clone();
        self.producer()?.publish(&queue, task.encode()?).await?;
        Ok(Enqueued {
            queue,
            user_id: args.user,
            platform: args.platform,
        })
    }

    async fn sync_now(&self, args: &SyncArgs) -> Result<SyncReport> {
        let pipeline = Pipeline::from_config(&self.config)?;
        let result = pipeline.sync.sync(args.user, args.platform).await;
        pipeline.browser.shutdown().await;
        Ok(result?)
    }

    fn credential_store(&self) -> Result<SqliteCredentialStore> {
        Ok(SqliteCredentialStore::open(&self.config.storage.credentials_db)?)
    }

    async fn set_credentials(&self, args: &CredentialSetArgs) -> Result<CredentialSaved> {
        let values = parse_pairs(&args.values)?;
        let credential = PlatformCredential::parse(args.platform, &values)?;
        let store = self.credential_store()?;
        store
            .save_credentials(args.user, args.platform, &credential.to_map())
            .await?;
        Ok(CredentialSaved::new(args.user, &credential))
    }

    async fn login(&self, args: &CredentialLoginArgs) -> Result<CredentialSaved> {
        let browser = Arc::new(
            BrowserSessionManager::new(self.config.browser.clone()).with_headless(false),
        );
        let sessions: Arc<dyn SessionProvider> = browser.clone();
        let store: Arc<dyn CredentialStore> = Arc::new(self.credential_store()?);
        let harvester = CredentialHarvester::new(sessions, store, Arc::new(PipelineMetrics::new()));
        let result = harvester.harvest(args.user, args.platform).await;
        browser.shutdown().await;
        let credential = result?;
        Ok(CredentialSaved::new(args.user, &credential))
    }

    fn existing_broker(&self) -> Result<SqliteBroker> {
        let path = Path::new(&self.config.broker.path);
        if !path.exists() {
            return Err(AppError::MissingResource(format!(
                "broker database missing: {}",
                path.display()
            )));
        }
        Ok(SqliteBroker::open_path(path)?)
    }

    fn queue_stats(&self) -> Result<QueueStatsReport> {
        let broker = self.existing_broker()?;
        Ok(QueueStatsReport {
            queues: broker.queue_stats()?,
        })
    }

    fn dlq_show(&self, args: &DlqShowArgs) -> Result<DeadLetterList> {
        let broker = self.existing_broker()?;
        let queue = dead_letter_queue_name(&args.queue);
        let messages = broker.list_messages(&queue, Some(args.limit))?;
        Ok(DeadLetterList { queue, messages })
    }

    fn dlq_export(&self, args: &DlqExportArgs) -> Result<ExportResult> {
        let broker = self.existing_broker()?;
        let queue = dead_letter_queue_name(&args.queue);
        let exported = broker.export_queue(&queue, &args.output)?;
        Ok(ExportResult {
            queue,
            exported,
            output: args.output.clone(),
        })
    }

    fn failures(&self, args: &FailuresArgs) -> Result<FailureList> {
        let observability = &self.config.observability;
        if !Path::new(&observability.ledger_db).exists() {
            return Ok(FailureList { rows: Vec::new() });
        }
        let ledger = FailureLedger::new(&observability.failure_log, &observability.ledger_db)?;
        Ok(FailureList {
            rows: ledger.recent_failures(args.platform, args.limit)?,
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let storage = &self.config.storage;
        vec![
            check_path("crosspost.toml", &self.config_path),
            check_database("broker", Path::new(&self.config.broker.path)),
            check_database("credentials", Path::new(&storage.credentials_db)),
            check_database("posts", Path::new(&storage.posts_db)),
            check_database("ledger", Path::new(&self.config.observability.ledger_db)),
            check_directory("captures", Path::new(&self.config.driver.capture_dir)),
        ]
    }
}

/// Splits `key=value` arguments; later keys win.
fn parse_pairs(raw: &[String]) -> Result<CredentialMap> {
    let mut values = CredentialMap::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| AppError::InvalidArgument(format!("expected KEY=VALUE, got `{pair}`")))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(AppError::InvalidArgument(format!("empty key in `{pair}`")));
        }
        values.insert(key.to_string(), value.trim().to_string());
    }
    Ok(values)
}

fn check_path(name: &str, path: &Path) -> HealthEntry {
    if path.exists() {
        HealthEntry::ok(name, format!("{}", path.display()))
    } else {
        HealthEntry::error(name, format!("{} missing", path.display()))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(name, format!("{} not created yet", path.display())),
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(name, format!("{} not created yet", path.display()));
    }
    match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => {
            let pragma: rusqlite::Result<String> =
                conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
            match pragma {
                Ok(result) if result.eq_ignore_ascii_case("ok") => {
                    HealthEntry::ok(name, "integrity ok".to_string())
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Err(err) => HealthEntry::error(name, format!("cannot open: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct Enqueued {
    pub queue: String,
    pub user_id: i64,
    pub platform: Platform,
}

impl DisplayFallback for Enqueued {
    fn display(&self) -> String {
        format!(
            "enqueued on {} (user={}, platform={})",
            self.queue, self.user_id, self.platform
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct SyncSummary(pub SyncReport);

impl DisplayFallback for SyncSummary {
    fn display(&self) -> String {
        format!(
            "{}: fetched {} posts, upserted {}",
            self.0.platform, self.0.fetched, self.0.upserted
        )
    }
}

#[derive(Debug, Serialize)]
pub struct CredentialSaved {
    pub user_id: i64,
    pub platform: Platform,
    /// Stored key names only; values never leave the store.
    pub keys: Vec<String>,
}

impl CredentialSaved {
    fn new(user_id: i64, credential: &PlatformCredential) -> Self {
        Self {
            user_id,
            platform: credential.platform(),
            keys: credential.to_map().into_keys().collect(),
        }
    }
}

impl DisplayFallback for CredentialSaved {
    fn display(&self) -> String {
        format!(
            "stored {} session for user {} ({})",
            self.platform,
            self.user_id,
            self.keys.join(", ")
        )
    }
}

#[derive(Debug, Serialize)]
pub struct QueueStatsReport {
    pub queues: Vec<QueueStats>,
}

impl DisplayFallback for QueueStatsReport {
    fn display(&self) -> String {
        if self.queues.is_empty() {
            return "no queues declared".to_string();
        }
        self.queues
            .iter()
            .map(|queue| {
                format!(
                    "{} ready={} unacked={} dlx={}",
                    queue.name,
                    queue.ready,
                    queue.unacked,
                    queue.dead_letter_exchange.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct DeadLetterList {
    pub queue: String,
    pub messages: Vec<StoredMessage>,
}

impl DisplayFallback for DeadLetterList {
    fn display(&self) -> String {
        if self.messages.is_empty() {
            return format!("{} is empty", self.queue);
        }
        let mut lines = Vec::new();
        for message in &self.messages {
            let retries = message
                .headers
                .get_u32(crosspost_core::queue::RETRY_COUNT_HEADER)
                .map(|count| count.to_string())
                .unwrap_or_else(|| "-".to_string());
            lines.push(format!(
                "#{id} {published} retries={retries} {body}",
                id = message.id,
                published = message.published_at.format("%Y-%m-%d %H:%M:%S"),
                body = truncate(&message.body, 120),
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub queue: String,
    pub exported: usize,
    pub output: PathBuf,
}

impl DisplayFallback for ExportResult {
    fn display(&self) -> String {
        format!(
            "exported {} messages from {} to {}",
            self.exported,
            self.queue,
            self.output.display()
        )
    }
}

#[derive(Debug, Serialize)]
pub struct FailureList {
    pub rows: Vec<FailureRecord>,
}

impl DisplayFallback for FailureList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no failures recorded".to_string();
        }
        self.rows
            .iter()
            .map(|failure| {
                format!(
                    "{ts} {platform} user={user} kind={kind} state={state} retry={retry} {message}",
                    ts = format_ts(&failure.timestamp),
                    platform = failure.platform,
                    user = failure.user_id,
                    kind = failure.kind,
                    state = failure.state.map(|state| state.as_str()).unwrap_or("-"),
                    retry = failure.retry_count,
                    message = truncate(&failure.message, 160),
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    match flat.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warn,
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crosspost_core::FailureKind;
    use tempfile::TempDir;

    fn context() -> (TempDir, AppContext) {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        let mut config = CrosspostConfig::default();
        config.broker.path = root.join("broker.sqlite").display().to_string();
        config.storage.credentials_db = root.join("credentials.sqlite").display().to_string();
        config.storage.posts_db = root.join("posts.sqlite").display().to_string();
        config.observability.ledger_db = root.join("ledger.sqlite").display().to_string();
        config.observability.failure_log = root.join("logs/failures.log").display().to_string();
        config.driver.capture_dir = root.join("captures").display().to_string();
        let context = AppContext::from_config(root.join("crosspost.toml"), config);
        (temp, context)
    }

    fn publish_args(content: Option<&str>) -> PublishArgs {
        PublishArgs {
            user: 7,
            platform: Platform::DevTo,
            title: "Hello".into(),
            content: content.map(str::to_string),
            content_file: None,
            tags: vec!["rust".into()],
            cover: None,
            blog_url: None,
        }
    }

    #[test]
    fn parses_nested_commands() {
        let cli = Cli::try_parse_from([
            "crosspostctl",
            "--format",
            "json",
            "credentials",
            "set",
            "--user",
            "3",
            "--platform",
            "dev.to",
            "remember_user_token=abc",
        ])
        .unwrap();
        match cli.command {
            Commands::Credentials(CredentialCommands::Set(args)) => {
                assert_eq!(args.platform, Platform::DevTo);
                assert_eq!(args.values, vec!["remember_user_token=abc".to_string()]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["crosspostctl", "sync", "--user", "1", "--platform", "myspace"]).is_err());
    }

    #[test]
    fn key_value_pairs_need_an_equals_sign() {
        let parsed = parse_pairs(&["uid=1".into(), "sid= two ".into()]).unwrap();
        assert_eq!(parsed.get("sid").map(String::as_str), Some("two"));
        assert!(matches!(
            parse_pairs(&["uid".into()]),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn enqueued_publish_shows_up_in_queue_stats() {
        let (_temp, context) = context();
        assert!(matches!(context.queue_stats(), Err(AppError::MissingResource(_))));

        let enqueued = context
            .enqueue_publish(&publish_args(Some("Body")))
            .await
            .unwrap();
        assert_eq!(enqueued.queue, "publish:post");

        let stats = context.queue_stats().unwrap();
        let publish = stats
            .queues
            .iter()
            .find(|queue| queue.name == "publish:post")
            .unwrap();
        assert_eq!(publish.ready, 1);
        assert!(stats.queues.iter().any(|queue| queue.name == "publish:post:dlq"));

        let dead = context
            .dlq_show(&DlqShowArgs {
                queue: "publish:post".into(),
                limit: 10,
            })
            .unwrap();
        assert!(dead.messages.is_empty());
        assert_eq!(dead.display(), "publish:post:dlq is empty");
    }

    #[tokio::test]
    async fn blank_content_is_rejected_before_enqueue() {
        let (_temp, context) = context();
        let err = context
            .enqueue_publish(&publish_args(Some("   ")))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        let err = context.enqueue_publish(&publish_args(None)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn credentials_are_validated_before_saving() {
        let (_temp, context) = context();
        let err = context
            .set_credentials(&CredentialSetArgs {
                user: 1,
                platform: Platform::Medium,
                values: vec!["uid=u".into()],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Credential(_)));

        let saved = context
            .set_credentials(&CredentialSetArgs {
                user: 1,
                platform: Platform::Medium,
                values: vec!["uid=u".into(), "sid=s".into()],
            })
            .await
            .unwrap();
        assert_eq!(saved.keys, vec!["sid".to_string(), "uid".to_string()]);

        let stored = context
            .credential_store()
            .unwrap()
            .get_credentials(1, Platform::Medium)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.values.get("uid").map(String::as_str), Some("u"));
    }

    #[test]
    fn failures_are_listed_newest_first() {
        let (_temp, context) = context();
        assert!(context
            .failures(&FailuresArgs {
                platform: None,
                limit: 5,
            })
            .unwrap()
            .rows
            .is_empty());

        let observability = &context.config.observability;
        let ledger = FailureLedger::new(&observability.failure_log, &observability.ledger_db).unwrap();
        for (offset, kind) in [(2, FailureKind::SyncTimeout), (1, FailureKind::WafBlock)] {
            ledger
                .record_failure(&FailureRecord {
                    timestamp: Utc::now() - chrono::Duration::minutes(offset),
                    platform: Platform::Medium,
                    user_id: 4,
                    state: None,
                    kind,
                    message: "boom".into(),
                    retry_count: 0,
                    capture: None,
                })
                .unwrap();
        }

        let list = context
            .failures(&FailuresArgs {
                platform: Some(Platform::Medium),
                limit: 5,
            })
            .unwrap();
        assert_eq!(list.rows.len(), 2);
        assert_eq!(list.rows[0].kind, FailureKind::WafBlock);
        assert!(list.display().contains("kind=waf_block"));
    }

    #[test]
    fn health_flags_missing_config_and_pending_databases() {
        let (_temp, context) = context();
        let report = context.health_check();
        assert!(matches!(report[0].status, CheckStatus::Error));
        assert!(report[1..]
            .iter()
            .all(|entry| matches!(entry.status, CheckStatus::Warn)));
    }
}

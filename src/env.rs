use clap::Parser;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::Level;
use url::Url;

use crate::sync::SyncPollerConfig;

pub(crate) async fn configure_sqlite_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let pool = SqlitePool::connect(database_url).await?;

    // WAL allows concurrent readers while the single writer (the batch
    // transaction) holds the write lock.
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    // Writers blocked behind another batch wait up to 10 seconds before
    // failing with "database is locked". Sequence allocation holds the
    // writer lock for a whole batch, so contention is expected and short.
    sqlx::query("PRAGMA busy_timeout = 10000")
        .execute(&pool)
        .await?;

    Ok(pool)
}

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) database_url: String,
    pub log_level: LogLevel,
    pub(crate) server_port: u16,
    pub(crate) upstream_stream_out_url: Option<Url>,
    pub(crate) upstream_register_url: Option<Url>,
    pub(crate) callback_stream_in_url: Option<Url>,
    pub(crate) sync_poll_interval: u64,
    pub(crate) sync_poll_max_jitter: u64,
    pub(crate) upstream_timeout: u64,
    pub(crate) fanout_queue_capacity: usize,
}

#[derive(Parser, Debug, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    database_url: String,
    #[clap(long, env, default_value = "info")]
    log_level: LogLevel,
    #[clap(long, env, default_value = "8080")]
    server_port: u16,
    /// Stream-out endpoint of the upstream authority; omit to run without
    /// an upstream (push-only node)
    #[clap(long, env)]
    upstream_stream_out_url: Option<Url>,
    /// Subscriber registration endpoint of the upstream authority
    #[clap(long, env)]
    upstream_register_url: Option<Url>,
    /// Publicly reachable URL of this node's stream-in endpoint, announced
    /// to the upstream on boot
    #[clap(long, env)]
    callback_stream_in_url: Option<Url>,
    /// Interval in seconds between upstream catch-up polls
    #[clap(long, env, default_value = "5")]
    sync_poll_interval: u64,
    /// Maximum jitter in seconds added to each poll to prevent thundering herd
    #[clap(long, env, default_value = "2")]
    sync_poll_max_jitter: u64,
    /// Timeout in seconds for upstream fetches and subscriber deliveries
    #[clap(long, env, default_value = "10")]
    upstream_timeout: u64,
    /// Bound on queued-but-undelivered fan-out notifications
    #[clap(long, env, default_value = "256")]
    fanout_queue_capacity: usize,
}

impl Env {
    pub fn into_config(self) -> Config {
        Config {
            database_url: self.database_url,
            log_level: self.log_level,
            server_port: self.server_port,
            upstream_stream_out_url: self.upstream_stream_out_url,
            upstream_register_url: self.upstream_register_url,
            callback_stream_in_url: self.callback_stream_in_url,
            sync_poll_interval: self.sync_poll_interval,
            sync_poll_max_jitter: self.sync_poll_max_jitter,
            upstream_timeout: self.upstream_timeout,
            fanout_queue_capacity: self.fanout_queue_capacity,
        }
    }
}

impl Config {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        configure_sqlite_pool(&self.database_url).await
    }

    pub const fn get_sync_poller_config(&self) -> SyncPollerConfig {
        SyncPollerConfig {
            polling_interval: Duration::from_secs(self.sync_poll_interval),
            max_jitter: Duration::from_secs(self.sync_poll_max_jitter),
        }
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.upstream_timeout))
            .build()
    }
}

pub fn setup_tracing(log_level: &LogLevel) {
    let level: Level = log_level.into();
    let default_filter = format!("likestream={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[cfg(test)]
pub mod tests {
    use super::*;

    pub(crate) fn create_test_config() -> Config {
        Config {
            database_url: ":memory:".to_string(),
            log_level: LogLevel::Debug,
            server_port: 8080,
            upstream_stream_out_url: None,
            upstream_register_url: None,
            callback_stream_in_url: None,
            sync_poll_interval: 5,
            sync_poll_max_jitter: 0,
            upstream_timeout: 2,
            fanout_queue_capacity: 16,
        }
    }

    #[test]
    fn parses_minimal_args_with_defaults() {
        let env = Env::try_parse_from(["server", "--db", ":memory:"]).unwrap();
        let config = env.into_config();

        assert_eq!(config.database_url, ":memory:");
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.sync_poll_interval, 5);
        assert!(config.upstream_stream_out_url.is_none());
    }

    #[test]
    fn parses_upstream_urls() {
        let env = Env::try_parse_from([
            "server",
            "--db",
            "likestream.db",
            "--upstream-stream-out-url",
            "http://authority.example/stream-out",
            "--upstream-register-url",
            "http://authority.example/subscribers/register",
            "--callback-stream-in-url",
            "http://replica.example/stream-in",
        ])
        .unwrap();
        let config = env.into_config();

        assert_eq!(
            config.upstream_stream_out_url.unwrap().as_str(),
            "http://authority.example/stream-out"
        );
        assert!(config.callback_stream_in_url.is_some());
    }

    #[test]
    fn rejects_invalid_upstream_url() {
        Env::try_parse_from([
            "server",
            "--db",
            ":memory:",
            "--upstream-stream-out-url",
            "not a url",
        ])
        .unwrap_err();
    }

    #[tokio::test]
    async fn configured_pool_serves_queries() {
        let config = create_test_config();
        let pool = config.get_sqlite_pool().await.unwrap();

        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(one, 1);
    }
}

//! Configuration module
//!
//! Process configuration for the publisher side and the scan worker: broker and
//! record store addresses, publish retry policy, fetch bounds and the worker's
//! reconnect cadence. Values come from the environment (and `.env`), with the
//! defaults listed on each constant below.

use std::env;
use std::time::Duration;

/// Name of the durable queue carrying scan requests.
pub const SCAN_QUEUE_NAME: &str = "file_scan_queue";

/// Unacknowledged messages a consumer may hold at once.
pub const SCAN_PREFETCH: u16 = 1;

const DEFAULT_DATABASE_URL: &str = "postgresql://localhost:5432/filescan";
const PUBLISH_MAX_ATTEMPTS: u32 = 3;
const PUBLISH_RETRY_DELAY_MS: u64 = 2000;
const FETCH_TIMEOUT_MS: u64 = 10_000;
const CLASSIFY_TIMEOUT_MS: u64 = 10_000;
const SETTLE_DELAY_MS: u64 = 0;
const RECONNECT_INTERVAL_MS: u64 = 5000;
const POLL_INTERVAL_MS: u64 = 1000;
const MESSAGE_LEASE_SECS: u64 = 300;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;

/// Output format of the log subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct ScanConfig {
    pub database_url: String,
    pub broker_url: String,
    pub queue_name: String,
    /// Queue receiving messages rejected without requeue. `None` drops them.
    pub dead_letter_queue: Option<String>,
    pub publish_max_attempts: u32,
    pub publish_retry_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub classify_timeout_ms: u64,
    /// Artificial delay after classification. Only affects throughput.
    pub settle_delay_ms: u64,
    /// Treat content that cannot be fetched as clean instead of failing the delivery.
    pub fail_open_on_fetch_error: bool,
    pub reconnect_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// How long an unacknowledged delivery stays reserved before it is redelivered.
    pub message_lease_secs: u64,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub log_format: LogFormat,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            broker_url: DEFAULT_DATABASE_URL.to_string(),
            queue_name: SCAN_QUEUE_NAME.to_string(),
            dead_letter_queue: Some(default_dead_letter_queue()),
            publish_max_attempts: PUBLISH_MAX_ATTEMPTS,
            publish_retry_delay_ms: PUBLISH_RETRY_DELAY_MS,
            fetch_timeout_ms: FETCH_TIMEOUT_MS,
            classify_timeout_ms: CLASSIFY_TIMEOUT_MS,
            settle_delay_ms: SETTLE_DELAY_MS,
            fail_open_on_fetch_error: true,
            reconnect_interval_ms: RECONNECT_INTERVAL_MS,
            poll_interval_ms: POLL_INTERVAL_MS,
            message_lease_secs: MESSAGE_LEASE_SECS,
            db_max_connections: DB_MAX_CONNECTIONS,
            db_timeout_seconds: DB_TIMEOUT_SECS,
            log_format: LogFormat::Text,
        }
    }
}

fn default_dead_letter_queue() -> String {
    format!("{}.dead", SCAN_QUEUE_NAME)
}

impl ScanConfig {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the configuration from an arbitrary key lookup. Unset or unparsable
    /// numeric values fall back to their defaults; malformed booleans are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, anyhow::Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);
        let broker_url = lookup("BROKER_URL")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| database_url.clone());

        let dead_letter_queue = match lookup("SCAN_DEAD_LETTER_QUEUE") {
            Some(value) if value.trim().is_empty() => None,
            Some(value) => Some(value.trim().to_string()),
            None => defaults.dead_letter_queue,
        };

        let fail_open_on_fetch_error = match lookup("SCAN_FETCH_FAIL_OPEN") {
            Some(value) => parse_bool(&value).ok_or_else(|| {
                anyhow::anyhow!("SCAN_FETCH_FAIL_OPEN must be true or false, got '{}'", value)
            })?,
            None => defaults.fail_open_on_fetch_error,
        };

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::to_lowercase) {
            Some(ref f) if f == "json" => LogFormat::Json,
            Some(ref f) if f == "text" || f.is_empty() => LogFormat::Text,
            Some(other) => {
                return Err(anyhow::anyhow!(
                    "LOG_FORMAT must be 'text' or 'json', got '{}'",
                    other
                ))
            }
            None => LogFormat::Text,
        };

        Ok(Self {
            database_url,
            broker_url,
            queue_name: SCAN_QUEUE_NAME.to_string(),
            dead_letter_queue,
            publish_max_attempts: parse_or(
                &lookup,
                "SCAN_PUBLISH_MAX_ATTEMPTS",
                defaults.publish_max_attempts,
            ),
            publish_retry_delay_ms: parse_or(
                &lookup,
                "SCAN_PUBLISH_RETRY_DELAY_MS",
                defaults.publish_retry_delay_ms,
            ),
            fetch_timeout_ms: parse_or(&lookup, "SCAN_FETCH_TIMEOUT_MS", defaults.fetch_timeout_ms),
            classify_timeout_ms: parse_or(
                &lookup,
                "SCAN_CLASSIFY_TIMEOUT_MS",
                defaults.classify_timeout_ms,
            ),
            settle_delay_ms: parse_or(&lookup, "SCAN_SETTLE_DELAY_MS", defaults.settle_delay_ms),
            fail_open_on_fetch_error,
            reconnect_interval_ms: parse_or(
                &lookup,
                "BROKER_RECONNECT_INTERVAL_MS",
                defaults.reconnect_interval_ms,
            ),
            poll_interval_ms: parse_or(&lookup, "SCAN_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            message_lease_secs: parse_or(
                &lookup,
                "SCAN_MESSAGE_LEASE_SECS",
                defaults.message_lease_secs,
            ),
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", defaults.db_max_connections),
            db_timeout_seconds: parse_or(&lookup, "DB_TIMEOUT_SECONDS", defaults.db_timeout_seconds),
            log_format,
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        for (name, url) in [("DATABASE_URL", &self.database_url), ("BROKER_URL", &self.broker_url)] {
            if !(url.starts_with("postgresql://") || url.starts_with("postgres://")) {
                return Err(anyhow::anyhow!(
                    "{} must be a valid PostgreSQL connection string",
                    name
                ));
            }
        }

        if self.publish_max_attempts == 0 {
            return Err(anyhow::anyhow!("SCAN_PUBLISH_MAX_ATTEMPTS must be at least 1"));
        }

        if self.fetch_timeout_ms == 0 || self.classify_timeout_ms == 0 {
            return Err(anyhow::anyhow!(
                "SCAN_FETCH_TIMEOUT_MS and SCAN_CLASSIFY_TIMEOUT_MS must be greater than 0"
            ));
        }

        if self.reconnect_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!(
                "BROKER_RECONNECT_INTERVAL_MS and SCAN_POLL_INTERVAL_MS must be greater than 0"
            ));
        }

        // A lease shorter than the worst-case handling time would redeliver messages
        // that are still being worked on.
        let worst_case_ms = self
            .fetch_timeout_ms
            .saturating_add(self.classify_timeout_ms)
            .saturating_add(self.settle_delay_ms);
        if self.message_lease_secs.saturating_mul(1000) <= worst_case_ms {
            return Err(anyhow::anyhow!(
                "SCAN_MESSAGE_LEASE_SECS ({}s) must exceed fetch and classify timeouts plus settle delay ({}ms)",
                self.message_lease_secs,
                worst_case_ms
            ));
        }

        if self.dead_letter_queue.as_deref() == Some(self.queue_name.as_str()) {
            return Err(anyhow::anyhow!(
                "SCAN_DEAD_LETTER_QUEUE must differ from the scan queue"
            ));
        }

        Ok(())
    }

    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn classify_timeout(&self) -> Duration {
        Duration::from_millis(self.classify_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn message_lease(&self) -> Duration {
        Duration::from_secs(self.message_lease_secs)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_seconds)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

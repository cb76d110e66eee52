use crate::error::{MonitorError, Result};
use crate::retry::RetryPolicy;
use crate::size::parse_size;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex is valid")
});

/// Settings as they arrive from the environment or the optional config file,
/// before validation. Keys are the lowercased environment variable names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawConfig {
    pub table_name: Option<String>,
    pub mv_names: Option<String>,
    pub storage_size: Option<String>,
    pub threshold: Option<String>,
    pub delete_percentage: Option<String>,
    pub db_url: Option<String>,
    pub clickhouse_username: Option<String>,
    pub clickhouse_password: Option<String>,

    #[serde(default = "default_time_column")]
    pub time_column: String,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_conn_timeout")]
    pub conn_timeout_secs: u64,

    #[serde(default = "default_conn_retry_interval")]
    pub conn_retry_interval_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_query_retry_interval")]
    pub query_retry_interval_secs: u64,

    #[serde(default = "default_skip_rounds")]
    pub skip_rounds: u32,

    #[serde(default)]
    pub enable_prometheus: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub table: TableConfig,
    pub storage: StorageConfig,
    pub clickhouse: ClickHouseConfig,
    pub schedule: ScheduleConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// The table holding the records.
    pub name: String,
    /// Materialized views derived from `name`, pruned in this order.
    pub derived: Vec<String>,
    /// Column holding the insertion time of each row.
    pub time_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    pub allocated_bytes: u64,
    /// Usage fraction above which records are deleted.
    pub threshold: f64,
    /// Fraction of the rows deleted per eviction.
    pub delete_percentage: f64,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ClickHouseConfig {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    pub monitor_interval: Duration,
    pub conn_timeout: Duration,
    pub conn_retry_interval: Duration,
    pub query_timeout: Duration,
    pub query_retry_interval: Duration,
    /// Ticks without eviction decisions after a deletion.
    pub skip_rounds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub enable_prometheus: bool,
    pub metrics_port: u16,
}

impl TableConfig {
    /// The monitored table followed by every derived table.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.derived.iter().map(String::as_str))
    }
}

impl ScheduleConfig {
    pub fn connection_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.conn_retry_interval, self.conn_timeout)
    }

    pub fn query_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.query_retry_interval, self.query_timeout)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(default_monitor_interval()),
            conn_timeout: Duration::from_secs(default_conn_timeout()),
            conn_retry_interval: Duration::from_secs(default_conn_retry_interval()),
            query_timeout: Duration::from_secs(default_query_timeout()),
            query_retry_interval: Duration::from_secs(default_query_retry_interval()),
            skip_rounds: default_skip_rounds(),
        }
    }
}

impl fmt::Debug for ClickHouseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl MonitorConfig {
    /// Loads the configuration from the optional config file and the
    /// process environment, the environment taking precedence.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path(), config::Environment::default())
    }

    pub fn load_from(config_path: &Path, env: config::Environment) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::from(config_path).required(false))
            .add_source(env);

        let raw: RawConfig = builder.build()?.try_deserialize()?;
        Self::from_raw(raw)
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chmon")
            .join("config.toml")
    }

    /// Validates raw settings. Every required field must be present.
    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let table_name = required(raw.table_name, "TABLE_NAME")?;
        let mv_names = raw.mv_names.ok_or(MonitorError::MissingConfig("MV_NAMES"))?;
        let storage_size = required(raw.storage_size, "STORAGE_SIZE")?;
        let threshold = required(raw.threshold, "THRESHOLD")?;
        let delete_percentage = required(raw.delete_percentage, "DELETE_PERCENTAGE")?;
        let url = required(raw.db_url, "DB_URL")?;
        let username = required(raw.clickhouse_username, "CLICKHOUSE_USERNAME")?;
        let password = required(raw.clickhouse_password, "CLICKHOUSE_PASSWORD")?;

        let name = identifier(table_name.trim(), "TABLE_NAME")?;
        let derived = mv_names
            .split_whitespace()
            .map(|mv| identifier(mv, "MV_NAMES"))
            .collect::<Result<Vec<_>>>()?;
        let time_column = identifier(raw.time_column.trim(), "TIME_COLUMN")?;

        let allocated_bytes = parse_size(storage_size.trim())?;
        if allocated_bytes == 0 {
            return Err(invalid("STORAGE_SIZE", "must be larger than 0"));
        }

        reqwest::Url::parse(url.trim())
            .map_err(|e| invalid("DB_URL", format!("{}: {}", url, e)))?;

        let schedule = ScheduleConfig {
            monitor_interval: positive_secs(raw.monitor_interval_secs, "MONITOR_INTERVAL_SECS")?,
            conn_timeout: Duration::from_secs(raw.conn_timeout_secs),
            conn_retry_interval: positive_secs(
                raw.conn_retry_interval_secs,
                "CONN_RETRY_INTERVAL_SECS",
            )?,
            query_timeout: Duration::from_secs(raw.query_timeout_secs),
            query_retry_interval: positive_secs(
                raw.query_retry_interval_secs,
                "QUERY_RETRY_INTERVAL_SECS",
            )?,
            skip_rounds: raw.skip_rounds,
        };

        Ok(Self {
            table: TableConfig {
                name,
                derived,
                time_column,
            },
            storage: StorageConfig {
                allocated_bytes,
                threshold: fraction(&threshold, "THRESHOLD")?,
                delete_percentage: fraction(&delete_percentage, "DELETE_PERCENTAGE")?,
            },
            clickhouse: ClickHouseConfig {
                url: url.trim().trim_end_matches('/').to_string(),
                username,
                password,
            },
            schedule,
            telemetry: TelemetryConfig {
                enable_prometheus: raw.enable_prometheus,
                metrics_port: raw.metrics_port,
            },
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(MonitorError::MissingConfig(field)),
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> MonitorError {
    MonitorError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}

// Names are interpolated into SQL and matched against `system.parts.table`,
// so only unqualified identifiers are accepted.
fn identifier(name: &str, field: &'static str) -> Result<String> {
    if IDENTIFIER_REGEX.is_match(name) {
        Ok(name.to_string())
    } else {
        Err(invalid(field, format!("{:?} is not a valid identifier", name)))
    }
}

/// Parses a fraction in (0, 1].
fn fraction(value: &str, field: &'static str) -> Result<f64> {
    let parsed: f64 = value
        .trim()
        .parse()
        .map_err(|e| invalid(field, format!("{:?}: {}", value, e)))?;
    if parsed > 0.0 && parsed <= 1.0 {
        Ok(parsed)
    } else {
        Err(invalid(field, format!("{} is not in (0, 1]", parsed)))
    }
}

fn positive_secs(secs: u64, field: &'static str) -> Result<Duration> {
    if secs == 0 {
        return Err(invalid(field, "must be larger than 0"));
    }
    Ok(Duration::from_secs(secs))
}

fn default_time_column() -> String { "timeInserted".to_string() }
fn default_monitor_interval() -> u64 { 60 }
fn default_conn_timeout() -> u64 { 60 }
fn default_conn_retry_interval() -> u64 { 10 }
fn default_query_timeout() -> u64 { 10 }
fn default_query_retry_interval() -> u64 { 1 }
fn default_skip_rounds() -> u32 { 3 }
fn default_metrics_port() -> u16 { 9090 }

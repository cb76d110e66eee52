//! ClickHouse over its HTTP interface.

use crate::config::ClickHouseConfig;
use crate::engine::{Row, StorageEngine};
use crate::error::{MonitorError, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const USER_HEADER: &str = "X-ClickHouse-User";
const KEY_HEADER: &str = "X-ClickHouse-Key";
const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

pub struct ClickHouseClient {
    client: Client,
    url: String,
    username: String,
    password: String,
}

/// Progress summary ClickHouse attaches to every HTTP response. Counters are
/// sent as JSON strings.
#[derive(Debug, Default, Deserialize)]
struct QuerySummary {
    #[serde(default)]
    written_rows: String,
}

impl ClickHouseClient {
    pub fn new(config: &ClickHouseConfig, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    /// Opens a client and pings ClickHouse until it answers or the policy's
    /// timeout elapses.
    pub async fn connect(
        config: &ClickHouseConfig,
        policy: RetryPolicy,
        request_timeout: Duration,
    ) -> Result<Self> {
        info!(url = %config.url, "Connecting to ClickHouse");

        let client = policy
            .run("connect to ClickHouse", move || async move {
                let client = Self::new(config, request_timeout)?;
                client.ping().await?;
                Ok(client)
            })
            .await
            .map_err(|_| MonitorError::ConnectionTimeout(policy.timeout))?;

        info!(url = %config.url, "Connected to ClickHouse");
        Ok(client)
    }

    async fn post(&self, sql: String) -> Result<Response> {
        let response = self
            .client
            .post(self.url.as_str())
            .header(USER_HEADER, &self.username)
            .header(KEY_HEADER, &self.password)
            .body(sql)
            .send()
            .await?;

        Self::check_status(response).await
    }

    async fn check_status(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(%status, error = %e, "Failed to read ClickHouse error body");
                String::new()
            }
        };
        Err(MonitorError::Database(format!(
            "HTTP {}: {}",
            status,
            body.trim()
        )))
    }
}

/// Parses the first row of a TabSeparated body.
fn first_row(body: &str) -> Result<Row> {
    body.lines()
        .next()
        .map(Row::from_tsv)
        .ok_or_else(|| MonitorError::InvalidResponse("query returned no rows".to_string()))
}

fn written_rows(summary: Option<&str>) -> u64 {
    summary
        .and_then(|s| serde_json::from_str::<QuerySummary>(s).ok())
        .and_then(|s| s.written_rows.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl StorageEngine for ClickHouseClient {
    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/ping", self.url))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn query_row(&self, sql: &str) -> Result<Row> {
        debug!(sql, "Querying ClickHouse");
        let body = self
            .post(format!("{} FORMAT TabSeparated", sql))
            .await?
            .text()
            .await?;
        first_row(&body)
    }

    async fn exec(&self, sql: &str) -> Result<u64> {
        debug!(sql, "Executing on ClickHouse");
        let response = self.post(sql.to_string()).await?;
        let summary = response
            .headers()
            .get(SUMMARY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        // Drain the body so the connection can be reused.
        response.bytes().await?;
        Ok(written_rows(summary.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> ClickHouseConfig {
        ClickHouseConfig {
            url: url.to_string(),
            username: "default".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_first_row() {
        let row = first_row("1024\t4096\n2048\t8192\n").unwrap();
        assert_eq!(row.get::<u64>(0).unwrap(), 1024);
        assert_eq!(row.get::<u64>(1).unwrap(), 4096);
    }

    #[test]
    fn test_first_row_empty_body() {
        assert!(matches!(first_row(""), Err(MonitorError::InvalidResponse(_))));
    }

    #[test]
    fn test_written_rows() {
        let summary = r#"{"read_rows":"10","read_bytes":"80","written_rows":"3","written_bytes":"24","total_rows_to_read":"10"}"#;
        assert_eq!(written_rows(Some(summary)), 3);
        assert_eq!(written_rows(Some("not json")), 0);
        assert_eq!(written_rows(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out() {
        // Nothing listens on the discard port.
        let policy = RetryPolicy::new(Duration::from_secs(10), Duration::from_secs(30));
        let result = ClickHouseClient::connect(
            &config("http://127.0.0.1:9"),
            policy,
            Duration::from_millis(200),
        )
        .await;

        match result {
            Err(MonitorError::ConnectionTimeout(timeout)) => {
                assert_eq!(timeout, Duration::from_secs(30))
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}

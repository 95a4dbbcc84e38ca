//! ClickHouse HTTP client used as the sink's downstream writer.
//!
//! Batches are inserted with one `INSERT ... FORMAT JSONEachRow` request per
//! batch over a pooled reqwest client. Retryable failures are retried with
//! exponential backoff up to the configured limit, which defaults to none.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::{ClickHouseConfig, Config};
use crate::sink::{BatchWriter, BoundedBatchSink, BoxError};

/// Default base delay for exponential backoff (in milliseconds).
const DEFAULT_BASE_DELAY_MS: u64 = 500;

/// Maximum delay between retries (in milliseconds).
const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Header carrying the query summary on successful inserts.
const SUMMARY_HEADER: &str = "x-clickhouse-summary";

/// Errors that can occur during ClickHouse operations.
#[derive(Debug)]
pub enum WriteError {
    /// HTTP request failed
    Request(reqwest::Error),

    /// Server returned an error status code
    Status { code: StatusCode, message: String },

    /// A record could not be encoded as JSON
    Serialize(serde_json::Error),

    /// All retry attempts exhausted
    RetriesExhausted { attempts: u32, last_error: String },

    /// Request timeout
    Timeout,

    /// Client configuration error
    Config(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Request(e) => write!(f, "HTTP request failed: {}", e),
            WriteError::Status { code, message } => {
                write!(f, "ClickHouse error ({}): {}", code, message.trim())
            }
            WriteError::Serialize(e) => write!(f, "Failed to encode record: {}", e),
            WriteError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "All {} retry attempts exhausted. Last error: {}",
                    attempts, last_error
                )
            }
            WriteError::Timeout => write!(f, "Request timed out"),
            WriteError::Config(e) => write!(f, "Client configuration error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WriteError::Request(e) => Some(e),
            WriteError::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for WriteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WriteError::Timeout
        } else {
            WriteError::Request(err)
        }
    }
}

impl From<serde_json::Error> for WriteError {
    fn from(err: serde_json::Error) -> Self {
        WriteError::Serialize(err)
    }
}

/// Subset of the `X-ClickHouse-Summary` header. ClickHouse sends the
/// counters as JSON strings.
#[derive(Debug, Clone, Deserialize)]
pub struct QuerySummary {
    #[serde(default)]
    pub written_rows: String,

    #[serde(default)]
    pub written_bytes: String,
}

impl QuerySummary {
    pub fn written_rows(&self) -> Option<usize> {
        self.written_rows.parse().ok()
    }
}

/// HTTP client for inserting batches into one ClickHouse table.
///
/// # Example
///
/// ```no_run
/// use broker_sink_bridge::clickhouse::ClickHouseClient;
/// use broker_sink_bridge::config::Config;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() {
///     let config = Config::default();
///     let client = ClickHouseClient::new(&config.clickhouse, &["d", "t", "m"])
///         .expect("Failed to create client");
///
///     let rows = vec![json!({"d": "2024-01-01 00:00:00", "t": "a/b", "m": 1})];
///     match client.insert(&rows).await {
///         Ok(written) => println!("Inserted {} rows", written),
///         Err(e) => eprintln!("Failed to insert: {}", e),
///     }
/// }
/// ```
pub struct ClickHouseClient {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// Base URL of the HTTP interface
    url: String,

    /// Full INSERT statement sent as the `query` parameter
    insert_query: String,

    database: String,
    user: Option<String>,
    password: Option<String>,

    /// Maximum number of retry attempts
    max_retries: u32,

    /// Request timeout duration
    timeout: Duration,
}

impl ClickHouseClient {
    /// Create a client for `config.table`.
    ///
    /// `default_columns` is used when the configuration lists no columns.
    ///
    /// # Errors
    ///
    /// Returns `WriteError::Config` if the HTTP client cannot be built.
    pub fn new(config: &ClickHouseConfig, default_columns: &[&str]) -> Result<Self, WriteError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| WriteError::Config(e.to_string()))?;

        let columns: Vec<String> = if config.columns.is_empty() {
            default_columns.iter().map(|c| c.to_string()).collect()
        } else {
            config.columns.clone()
        };

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            insert_query: insert_statement(&config.database, &config.table, &columns),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            max_retries: config.max_retries,
            timeout: config.request_timeout,
        })
    }

    /// Check that the server answers on `/ping`.
    pub async fn ping(&self) -> Result<(), WriteError> {
        let response = self
            .client
            .get(format!("{}/ping", self.url))
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WriteError::Status {
                code: status,
                message: response.text().await.unwrap_or_default(),
            })
        }
    }

    /// Insert a batch of records.
    ///
    /// Returns the number of rows written as reported by the server, or the
    /// batch length when the server sends no summary.
    ///
    /// # Retryable Errors
    ///
    /// - Network connection errors
    /// - Request timeouts
    /// - Server errors (5xx status codes) and 429
    pub async fn insert<R: Serialize>(&self, records: &[R]) -> Result<usize, WriteError> {
        if records.is_empty() {
            return Ok(0);
        }

        let body = encode_json_each_row(records)?;
        let batch_size = records.len();

        debug!(
            batch_size = batch_size,
            bytes = body.len(),
            query = %self.insert_query,
            "Inserting batch"
        );

        let mut attempt = 0;
        loop {
            let err = match self.send_request(body.clone()).await {
                Ok(written) => return Ok(written.unwrap_or(batch_size)),
                Err(err) => err,
            };

            if !self.is_retryable_error(&err) || attempt >= self.max_retries {
                if attempt == 0 {
                    return Err(err);
                }
                error!(error = %err, attempts = attempt + 1, "Insert failed permanently");
                return Err(WriteError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: err.to_string(),
                });
            }

            attempt += 1;
            let delay = self.backoff_delay(attempt);
            warn!(
                error = %err,
                attempt = attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Insert failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Send a single insert request without retry logic.
    async fn send_request(&self, body: String) -> Result<Option<usize>, WriteError> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .query(&[
                ("database", self.database.as_str()),
                ("query", self.insert_query.as_str()),
                ("input_format_skip_unknown_fields", "1"),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body);

        if let Some(user) = &self.user {
            request = request.header("X-ClickHouse-User", user);
        }
        if let Some(password) = &self.password {
            request = request.header("X-ClickHouse-Key", password);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            let written = response
                .headers()
                .get(SUMMARY_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_summary)
                .and_then(|s| s.written_rows());
            Ok(written)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            Err(WriteError::Status {
                code: status,
                message,
            })
        }
    }

    /// Delay before retry `attempt` (1-based): the base delay doubled per
    /// earlier attempt, plus up to 25% jitter, capped at the maximum.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = DEFAULT_BASE_DELAY_MS.saturating_mul(1 << attempt.saturating_sub(1).min(10));
        let jitter = rand::random::<u64>() % (base / 4 + 1);
        Duration::from_millis(base.saturating_add(jitter).min(MAX_RETRY_DELAY_MS))
    }

    /// Connection failures, timeouts, 5xx and 429 are worth another attempt.
    fn is_retryable_error(&self, error: &WriteError) -> bool {
        match error {
            WriteError::Request(e) => e.is_connect() || e.is_timeout(),
            WriteError::Timeout => true,
            WriteError::Status { code, .. } => {
                code.is_server_error() || *code == StatusCode::TOO_MANY_REQUESTS
            }
            WriteError::Serialize(_) | WriteError::RetriesExhausted { .. } | WriteError::Config(_) => {
                false
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn insert_query(&self) -> &str {
        &self.insert_query
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl<R> BatchWriter<R> for ClickHouseClient
where
    R: Serialize + Send + Sync + 'static,
{
    async fn write_batch(&self, records: &[R]) -> Result<usize, BoxError> {
        Ok(self.insert(records).await?)
    }
}

/// Build the sink in front of a ClickHouse writer.
///
/// Returns `None` when `CLICKHOUSE_ENABLED` is false, in which case records
/// are neither buffered nor written.
pub fn build_sink<R>(
    config: &Config,
    default_columns: &[&str],
) -> Result<Option<BoundedBatchSink<R, ClickHouseClient>>, WriteError>
where
    R: Serialize + Send + Sync + 'static,
{
    if !config.clickhouse.enabled {
        return Ok(None);
    }

    let client = ClickHouseClient::new(&config.clickhouse, default_columns)?;
    debug!(
        url = %client.url(),
        query = %client.insert_query(),
        "ClickHouse client initialized"
    );
    Ok(Some(BoundedBatchSink::new(config.sink.clone(), client)))
}

/// Build the INSERT statement for a table and column list.
fn insert_statement(database: &str, table: &str, columns: &[String]) -> String {
    let target = format!("{}.{}", quote_ident(database), quote_ident(table));

    if columns.is_empty() {
        format!("INSERT INTO {} FORMAT JSONEachRow", target)
    } else {
        let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "INSERT INTO {} ({}) FORMAT JSONEachRow",
            target,
            cols.join(", ")
        )
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Encode records as newline-delimited JSON.
fn encode_json_each_row<R: Serialize>(records: &[R]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for record in records {
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

fn parse_summary(raw: &str) -> Option<QuerySummary> {
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    fn test_client(max_retries: u32) -> ClickHouseClient {
        let mut config = Config::default().clickhouse;
        config.max_retries = max_retries;
        ClickHouseClient::new(&config, &["d", "t", "m"]).unwrap()
    }

    #[test]
    fn test_write_error_display() {
        let err = WriteError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = WriteError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Code: 27. Cannot parse input\n".to_string(),
        };
        assert!(format!("{}", err).contains("400"));
        assert!(format!("{}", err).ends_with("Cannot parse input"));

        let err = WriteError::RetriesExhausted {
            attempts: 3,
            last_error: "Connection refused".to_string(),
        };
        assert!(format!("{}", err).contains("3"));
        assert!(format!("{}", err).contains("Connection refused"));
    }

    #[test]
    fn test_client_creation() {
        let client = test_client(0);
        assert_eq!(client.url(), "http://localhost:8123");
        assert_eq!(client.max_retries(), 0);
        assert_eq!(client.timeout(), Duration::from_secs(30));
        assert_eq!(
            client.insert_query(),
            "INSERT INTO `default`.`mqtt` (`d`, `t`, `m`) FORMAT JSONEachRow"
        );
    }

    #[test]
    fn test_configured_columns_override_defaults() {
        let mut config = Config::default().clickhouse;
        config.table = "bookings".to_string();
        config.columns = vec!["tenantId".to_string(), "fleetId".to_string()];

        let client = ClickHouseClient::new(&config, &["d", "t", "m"]).unwrap();
        assert_eq!(
            client.insert_query(),
            "INSERT INTO `default`.`bookings` (`tenantId`, `fleetId`) FORMAT JSONEachRow"
        );
    }

    #[test]
    fn test_build_sink_respects_enabled_flag() {
        let mut config = Config::default();
        config.clickhouse.enabled = false;
        let sink = build_sink::<serde_json::Value>(&config, &["d", "t", "m"]).unwrap();
        assert!(sink.is_none());

        config.clickhouse.enabled = true;
        config.sink = crate::sink::SinkConfig::new(25);
        let sink = build_sink::<serde_json::Value>(&config, &["tenantId"])
            .unwrap()
            .expect("enabled ClickHouse should yield a sink");
        assert_eq!(sink.config().capacity, 25);
        assert_eq!(
            sink.writer().insert_query(),
            "INSERT INTO `default`.`mqtt` (`tenantId`) FORMAT JSONEachRow"
        );
    }

    #[test]
    fn test_insert_statement_without_columns() {
        assert_eq!(
            insert_statement("db", "events", &[]),
            "INSERT INTO `db`.`events` FORMAT JSONEachRow"
        );
    }

    #[test]
    fn test_quote_ident_escapes_backticks() {
        assert_eq!(quote_ident("we`ird"), "`we\\`ird`");
    }

    #[test]
    fn test_encode_json_each_row() {
        let rows = vec![json!({"t": "a", "m": 1}), json!({"t": "b", "m": null})];
        let body = encode_json_each_row(&rows).unwrap();
        let lines: Vec<&str> = body.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(body.ends_with('\n'));
        assert_eq!(serde_json::from_str::<serde_json::Value>(lines[0]).unwrap(), rows[0]);
        assert_eq!(serde_json::from_str::<serde_json::Value>(lines[1]).unwrap(), rows[1]);
    }

    #[test]
    fn test_parse_summary() {
        let raw = r#"{"read_rows":"0","read_bytes":"0","written_rows":"3","written_bytes":"84","total_rows_to_read":"0"}"#;
        let summary = parse_summary(raw).unwrap();
        assert_eq!(summary.written_rows(), Some(3));

        assert!(parse_summary("not json").is_none());
    }

    #[test]
    fn test_backoff_delay_doubles_per_attempt() {
        let client = test_client(3);

        for (attempt, base) in [(1u32, 500u128), (2, 1000), (3, 2000)] {
            let delay = client.backoff_delay(attempt).as_millis();
            assert!(delay >= base, "attempt {} delay {}", attempt, delay);
            assert!(delay <= base + base / 4, "attempt {} delay {}", attempt, delay);
        }
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let client = test_client(3);
        let delay = client.backoff_delay(20);
        assert!(delay.as_millis() <= MAX_RETRY_DELAY_MS as u128);
    }

    #[test]
    fn test_retryable_error_detection() {
        let client = test_client(3);

        assert!(client.is_retryable_error(&WriteError::Timeout));

        assert!(client.is_retryable_error(&WriteError::Status {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message: "Server error".to_string(),
        }));

        assert!(client.is_retryable_error(&WriteError::Status {
            code: StatusCode::TOO_MANY_REQUESTS,
            message: "Too many simultaneous queries".to_string(),
        }));

        assert!(!client.is_retryable_error(&WriteError::Status {
            code: StatusCode::BAD_REQUEST,
            message: "Unknown column".to_string(),
        }));

        assert!(!client.is_retryable_error(&WriteError::Config("config error".to_string())));
    }

    #[tokio::test]
    async fn test_insert_empty_batch_skips_request() {
        let client = test_client(0);
        let rows: Vec<serde_json::Value> = Vec::new();
        assert_eq!(client.insert(&rows).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_unreachable_server_fails() {
        let mut config = Config::default().clickhouse;
        // Port 9 (discard) on localhost is not an HTTP server
        config.url = "http://127.0.0.1:9".to_string();
        config.request_timeout = Duration::from_secs(2);
        let client = ClickHouseClient::new(&config, &["m"]).unwrap();

        let result = client.insert(&[json!({"m": 1})]).await;
        assert!(result.is_err());
    }
}

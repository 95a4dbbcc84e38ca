//! Configuration module for the bridges.
//!
//! Every setting comes from an environment variable with a default. Parsing
//! goes through [`Config::from_source`] so tests can supply values without
//! touching the process environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::sink::{FailurePolicy, SinkConfig, DEFAULT_CAPACITY};

/// Default MQTT broker URL
const DEFAULT_MQTT_BROKER: &str = "mqtt://localhost:1883";

/// Default ClickHouse HTTP interface URL
const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123";

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 100_000;

/// Bounds for the optional interval flush
const MIN_FLUSH_INTERVAL_SECS: u64 = 1;
const MAX_FLUSH_INTERVAL_SECS: u64 = 3_600;

/// Default rows per raw data log file
const DEFAULT_RAW_MAX_ROWS: u64 = 100_000;

/// Default I/O summary interval in seconds
const DEFAULT_SUMMARY_INTERVAL_SECS: u64 = 15;

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// MQTT connection settings.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,

    /// Connect over TLS (`mqtts://`)
    pub tls: bool,

    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,

    /// Subscription filter
    pub topic: String,

    /// QoS for subscriptions and keep-alive publishes (0, 1 or 2)
    pub qos: u8,

    /// Interval between keep-alive publishes
    pub keep_alive_interval: Duration,
    pub keep_alive_topic: String,

    /// Leading topic levels removed before a topic is stored
    pub topic_strip_levels: usize,
}

/// ClickHouse connection settings.
#[derive(Debug, Clone)]
pub struct ClickHouseConfig {
    /// When false, records are not buffered or written at all
    pub enabled: bool,

    /// Base URL of the HTTP interface, without a trailing slash
    pub url: String,

    pub database: String,
    pub table: String,
    pub user: Option<String>,
    pub password: Option<String>,

    /// Column list for inserts. Empty means the binary's default.
    pub columns: Vec<String>,

    pub request_timeout: Duration,
    pub max_retries: u32,
}

/// Raw JSONL file logging settings.
#[derive(Debug, Clone)]
pub struct RawLogConfig {
    pub enabled: bool,
    pub dir: String,

    /// Rows written before rolling to a new file
    pub max_rows: u64,
}

/// Configuration shared by the bridge binaries.
#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub clickhouse: ClickHouseConfig,
    pub sink: SinkConfig,
    pub raw_log: RawLogConfig,

    /// Interval between I/O and topic summaries
    pub summary_interval: Duration,

    /// Upper bound on the final drain at shutdown
    pub shutdown_timeout: Duration,

    /// Log every decoded record
    pub verbose: bool,
}

/// Typed access to a key/value source.
struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.optional(key) {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::for_var(key, format!("'{}' is not a valid number", value))),
            None => Ok(default),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.optional(key) {
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(true),
                "false" | "0" | "no" => Ok(false),
                _ => Err(ConfigError::for_var(
                    key,
                    format!("'{}' is not a valid boolean", value),
                )),
            },
            None => Ok(default),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.optional(key)
            .map(|v| {
                v.split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable is set to a value that does not
    /// parse or falls outside its allowed range.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use broker_sink_bridge::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Broker: {}:{}", config.mqtt.host, config.mqtt.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_source<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source { lookup };

        Ok(Self {
            mqtt: Self::parse_mqtt(&src)?,
            clickhouse: Self::parse_clickhouse(&src)?,
            sink: Self::parse_sink(&src)?,
            raw_log: Self::parse_raw_log(&src)?,
            summary_interval: Duration::from_secs(Self::parse_nonzero_secs(
                &src,
                "SUMMARY_INTERVAL_SECS",
                DEFAULT_SUMMARY_INTERVAL_SECS,
            )?),
            shutdown_timeout: Duration::from_secs(Self::parse_nonzero_secs(
                &src,
                "SHUTDOWN_TIMEOUT_SECS",
                10,
            )?),
            verbose: src.bool("VERBOSE", false)?,
        })
    }

    fn parse_mqtt<F>(src: &Source<F>) -> Result<MqttConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let (host, port, tls) = parse_broker_url(&src.string("MQTT_BROKER", DEFAULT_MQTT_BROKER))?;

        let qos: u8 = src.parse("MQTT_QOS", 1)?;
        if qos > 2 {
            return Err(ConfigError::for_var("MQTT_QOS", format!("QoS {} must be 0, 1 or 2", qos)));
        }

        let keep_alive_secs = Self::parse_nonzero_secs(src, "MQTT_KEEP_ALIVE_SECS", 30)?;

        Ok(MqttConfig {
            host,
            port,
            tls,
            username: src.optional("MQTT_USERNAME"),
            password: src.optional("MQTT_PASSWORD"),
            client_id: src
                .optional("MQTT_CLIENT_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            topic: src.string("MQTT_TOPIC", "#"),
            qos,
            keep_alive_interval: Duration::from_secs(keep_alive_secs),
            keep_alive_topic: src.string("MQTT_KEEP_ALIVE_TOPIC", "keepalive"),
            topic_strip_levels: src.parse("MQTT_TOPIC_STRIP_LEVELS", 2)?,
        })
    }

    fn parse_clickhouse<F>(src: &Source<F>) -> Result<ClickHouseConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = src
            .string("CLICKHOUSE_URL", DEFAULT_CLICKHOUSE_URL)
            .trim_end_matches('/')
            .to_string();
        Url::parse(&url)
            .map_err(|e| ConfigError::for_var("CLICKHOUSE_URL", format!("'{}': {}", url, e)))?;

        Ok(ClickHouseConfig {
            enabled: src.bool("CLICKHOUSE_ENABLED", true)?,
            url,
            database: src.string("CLICKHOUSE_DATABASE", "default"),
            table: src.string("CLICKHOUSE_TABLE", "mqtt"),
            user: src.optional("CLICKHOUSE_USER"),
            password: src.optional("CLICKHOUSE_PASSWORD"),
            columns: src.list("CLICKHOUSE_COLUMNS"),
            request_timeout: Duration::from_secs(Self::parse_nonzero_secs(
                src,
                "CLICKHOUSE_REQUEST_TIMEOUT_SECS",
                30,
            )?),
            max_retries: src.parse("CLICKHOUSE_MAX_RETRIES", 0)?,
        })
    }

    /// Parse batch size, optional flush interval and failure policy.
    fn parse_sink<F>(src: &Source<F>) -> Result<SinkConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_var = "CLICKHOUSE_BATCH_SIZE";
        let batch_size: usize = src.parse(env_var, DEFAULT_CAPACITY)?;

        if batch_size == 0 {
            return Err(ConfigError::for_var(env_var, "batch size must be greater than 0"));
        }

        if batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::for_var(
                env_var,
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        let mut sink = SinkConfig::new(batch_size);

        let env_var = "CLICKHOUSE_FLUSH_INTERVAL_SECS";
        if src.optional(env_var).is_some() {
            let interval: u64 = src.parse(env_var, 0)?;

            if interval < MIN_FLUSH_INTERVAL_SECS {
                return Err(ConfigError::for_var(
                    env_var,
                    format!(
                        "flush interval {} is below minimum ({}s)",
                        interval, MIN_FLUSH_INTERVAL_SECS
                    ),
                ));
            }

            if interval > MAX_FLUSH_INTERVAL_SECS {
                return Err(ConfigError::for_var(
                    env_var,
                    format!(
                        "flush interval {} exceeds maximum ({}s)",
                        interval, MAX_FLUSH_INTERVAL_SECS
                    ),
                ));
            }

            sink = sink.with_flush_interval(Duration::from_secs(interval));
        }

        if let Some(policy) = src.optional("SINK_FAILURE_POLICY") {
            let policy: FailurePolicy = policy
                .parse()
                .map_err(|e: String| ConfigError::for_var("SINK_FAILURE_POLICY", e))?;
            sink = sink.with_failure_policy(policy);
        }

        let max_requeued: usize = src.parse("SINK_MAX_REQUEUED", sink.max_requeued)?;
        sink = sink.with_max_requeued(max_requeued);

        Ok(sink)
    }

    fn parse_raw_log<F>(src: &Source<F>) -> Result<RawLogConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_rows: u64 = src.parse("LOG_RAW_MAX_ROWS", DEFAULT_RAW_MAX_ROWS)?;
        if max_rows == 0 {
            return Err(ConfigError::for_var(
                "LOG_RAW_MAX_ROWS",
                "max rows must be greater than 0",
            ));
        }

        Ok(RawLogConfig {
            enabled: src.bool("LOG_RAW_ENABLED", false)?,
            dir: src.string("LOG_RAW_DIR", "."),
            max_rows,
        })
    }

    fn parse_nonzero_secs<F>(src: &Source<F>, key: &str, default: u64) -> Result<u64, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let secs: u64 = src.parse(key, default)?;
        if secs == 0 {
            return Err(ConfigError::for_var(key, "interval must be greater than 0"));
        }
        Ok(secs)
    }
}

/// Split a broker URL into host, port and TLS flag.
fn parse_broker_url(raw: &str) -> Result<(String, u16, bool), ConfigError> {
    let env_var = "MQTT_BROKER";
    let url = Url::parse(raw).map_err(|e| ConfigError::for_var(env_var, format!("'{}': {}", raw, e)))?;

    let (tls, default_port) = match url.scheme() {
        "mqtt" | "tcp" => (false, 1883),
        "mqtts" | "ssl" => (true, 8883),
        other => {
            return Err(ConfigError::for_var(
                env_var,
                format!("unsupported scheme '{}'", other),
            ))
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::for_var(env_var, format!("'{}' has no host", raw)))?;

    Ok((host.to_string(), url.port().unwrap_or(default_port), tls))
}

impl Default for Config {
    /// Create a configuration from defaults only.
    ///
    /// Useful for tests; the MQTT client id is freshly generated.
    fn default() -> Self {
        match Self::from_source(|_| None) {
            Ok(config) => config,
            Err(e) => unreachable!("defaults must be valid: {}", e),
        }
    }
}

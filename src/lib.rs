//! Broker Sink Bridge Library
//!
//! Components for moving broker messages into ClickHouse in batches:
//!
//! - **sink**: Bounded batching buffer with size, interval and drain flushes
//! - **clickhouse**: HTTP writer with retry logic
//! - **config**: Environment-based configuration
//! - **mqtt**: MQTT connection setup and message-to-record mapping
//! - **events**: Event envelope decoding
//! - **raw_log**: Rolling JSONL raw data files
//! - **stats**: Throughput counters and per-topic tally
//!
//! # Example
//!
//! ```no_run
//! use broker_sink_bridge::clickhouse::ClickHouseClient;
//! use broker_sink_bridge::config::Config;
//! use broker_sink_bridge::mqtt::{MqttRecord, MQTT_COLUMNS};
//! use broker_sink_bridge::sink::BoundedBatchSink;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     let client = ClickHouseClient::new(&config.clickhouse, MQTT_COLUMNS)
//!         .expect("Failed to create client");
//!     let sink = BoundedBatchSink::new(config.sink.clone(), client);
//!
//!     sink.append(MqttRecord::from_publish("acme/site/line1/temp", br#"{"value":21}"#, 2));
//!     sink.drain().await.ok();
//! }
//! ```

pub mod clickhouse;
pub mod config;
pub mod events;
pub mod mqtt;
pub mod raw_log;
pub mod shutdown;
pub mod sink;
pub mod stats;
pub mod telemetry;

pub use clickhouse::{ClickHouseClient, QuerySummary, WriteError};
pub use config::{ClickHouseConfig, Config, ConfigError, MqttConfig, RawLogConfig};
pub use events::{decode_event, EventEnvelope, EventError};
pub use mqtt::MqttRecord;
pub use raw_log::{RawLogError, RollingFileLogger};
pub use sink::{
    BatchWriter, BoundedBatchSink, BoxError, FailurePolicy, FlushError, FlushTrigger, SinkConfig,
    SinkState, SinkStats,
};
pub use stats::{IoCounters, IoSummary, TopicTally};

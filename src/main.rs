//! Broker Sink Bridge - MQTT to ClickHouse bridge
//!
//! Subscribes to an MQTT topic filter, maps each message to a `{d, t, m}`
//! record and batches the records into ClickHouse through the bounded sink.
//!
//! ## Features
//!
//! - Size-triggered batch writes that never block the message loop
//! - Optional interval flush and raw JSONL data files
//! - Periodic keep-alive publishes and I/O summaries
//! - Drain of buffered records on Ctrl+C
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `MQTT_BROKER`: Broker URL (default: mqtt://localhost:1883)
//! - `MQTT_TOPIC`: Subscription filter (default: #)
//! - `CLICKHOUSE_URL`: HTTP interface URL (default: http://localhost:8123)
//! - `CLICKHOUSE_TABLE`: Target table (default: mqtt)
//! - `CLICKHOUSE_BATCH_SIZE`: Records per batch (default: 10000)
//! - `SINK_FAILURE_POLICY`: `drop` or `requeue` (default: drop)
//! - `LOG_RAW_ENABLED`: Write raw JSONL files (default: false)
//! - `RUST_LOG`: Logging level filter (default: info)

use rumqttc::{Event, Packet};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use broker_sink_bridge::clickhouse::{build_sink, ClickHouseClient};
use broker_sink_bridge::config::Config;
use broker_sink_bridge::mqtt::{self, MqttRecord, ReconnectPause, MQTT_COLUMNS};
use broker_sink_bridge::raw_log::RollingFileLogger;
use broker_sink_bridge::shutdown::{drain_sink, wait_for_signal};
use broker_sink_bridge::sink::BoundedBatchSink;
use broker_sink_bridge::stats::IoCounters;
use broker_sink_bridge::telemetry::init_tracing;

type RecordSink = BoundedBatchSink<MqttRecord, ClickHouseClient>;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting MQTT bridge...");

    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                broker = %format!("{}:{}", config.mqtt.host, config.mqtt.port),
                topic = %config.mqtt.topic,
                clickhouse_enabled = config.clickhouse.enabled,
                batch_size = config.sink.capacity,
                failure_policy = %config.sink.failure_policy,
                raw_log = config.raw_log.enabled,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let sink: Option<RecordSink> = match build_sink(&config, MQTT_COLUMNS) {
        Ok(Some(sink)) => {
            let writer = sink.writer();
            info!(
                url = %writer.url(),
                query = %writer.insert_query(),
                max_retries = writer.max_retries(),
                timeout_secs = writer.timeout().as_secs(),
                "ClickHouse sink ready"
            );
            if let Err(e) = writer.ping().await {
                warn!(error = %e, "ClickHouse ping failed, continuing");
            }
            Some(sink)
        }
        Ok(None) => {
            info!("ClickHouse disabled, records will not be stored");
            None
        }
        Err(e) => {
            error!(error = %e, "Failed to create ClickHouse client");
            std::process::exit(1);
        }
    };

    let interval_flush = match (&sink, config.sink.flush_interval) {
        (Some(sink), Some(every)) => Some(sink.spawn_interval_flush(every)),
        _ => None,
    };

    let mut raw_log = if config.raw_log.enabled {
        match RollingFileLogger::from_config(&config.raw_log) {
            Ok(logger) => Some(logger),
            Err(e) => {
                error!(error = %e, dir = %config.raw_log.dir, "Failed to open raw data log");
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let (client, mut event_loop) = mqtt::connect(&config.mqtt);
    let mut counters = IoCounters::new();

    let mut keep_alive = interval(config.mqtt.keep_alive_interval);
    let mut summary = interval(config.summary_interval);
    // Skip the immediate first ticks
    keep_alive.tick().await;
    summary.tick().await;

    let mut reconnect = ReconnectPause::default();
    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    info!("MQTT bridge running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            event = event_loop.poll(), if !reconnect.is_armed() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!(code = ?ack.code, "Connected to MQTT broker");
                    if let Err(e) = mqtt::subscribe(&client, &config.mqtt) {
                        error!(error = %e, topic = %config.mqtt.topic, "Failed to subscribe");
                    }
                    mqtt::send_keep_alive(&client, &config.mqtt);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    counters.record_received();

                    let record = MqttRecord::from_publish(
                        &publish.topic,
                        &publish.payload,
                        config.mqtt.topic_strip_levels,
                    );
                    if config.verbose {
                        debug!(topic = %record.t, value = %record.m, "Message received");
                    }

                    if let Some(logger) = raw_log.as_mut() {
                        if let Err(e) = logger.log(&record) {
                            error!(error = %e, "Failed to write raw data");
                        }
                    }

                    if let Some(sink) = &sink {
                        sink.append(record);
                        counters.record_sent();
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection error, retrying in {:?}", reconnect.delay());
                    reconnect.arm();
                }
            },

            _ = reconnect.elapsed(), if reconnect.is_armed() => {}

            _ = keep_alive.tick() => mqtt::send_keep_alive(&client, &config.mqtt),

            _ = summary.tick() => counters.take_summary().log(),
        }
    }

    info!("Initiating graceful shutdown...");

    if let Some(handle) = interval_flush {
        handle.abort();
    }

    if let Some(sink) = &sink {
        drain_sink(sink, config.shutdown_timeout).await;
    }

    mqtt::disconnect(&client, &mut event_loop, config.shutdown_timeout).await;

    if let Some(logger) = raw_log {
        if let Err(e) = logger.close() {
            warn!(error = %e, "Failed to flush raw data log");
        }
    }

    counters.take_summary().log();
    info!("MQTT bridge stopped");
}


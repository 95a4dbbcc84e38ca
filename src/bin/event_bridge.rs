//! Event bridge - newline-delimited event bodies to ClickHouse
//!
//! Reads one event envelope per line from stdin, decodes its base64 JSON
//! payload and batches the result into the `CLICKHOUSE_TABLE` table with the
//! booking column list. With `CLICKHOUSE_ENABLED=false` events are only
//! decoded and counted. Stops on end of input or Ctrl+C, draining the sink
//! either way.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use broker_sink_bridge::clickhouse::{build_sink, ClickHouseClient};
use broker_sink_bridge::config::Config;
use broker_sink_bridge::events::{decode_event, BOOKING_COLUMNS};
use broker_sink_bridge::shutdown::{drain_sink, wait_for_signal};
use broker_sink_bridge::sink::BoundedBatchSink;
use broker_sink_bridge::stats::IoCounters;
use broker_sink_bridge::telemetry::init_tracing;

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting event bridge...");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let sink: Option<BoundedBatchSink<Value, ClickHouseClient>> =
        match build_sink(&config, BOOKING_COLUMNS) {
            Ok(Some(sink)) => Some(sink),
            Ok(None) => {
                info!("ClickHouse disabled, events will be decoded but not stored");
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

    let mut counters = IoCounters::new();
    let mut skipped: u64 = 0;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    info!("Reading events from stdin");

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let body = line.trim();
                    if body.is_empty() {
                        continue;
                    }
                    counters.record_received();

                    match decode_event(body) {
                        Ok(record) => {
                            if config.verbose {
                                info!(record = %record, "Event decoded");
                            }
                            if let Some(sink) = &sink {
                                sink.append(record);
                                counters.record_sent();
                            }
                        }
                        Err(e) => {
                            skipped += 1;
                            warn!(error = %e, "Skipping undecodable event");
                        }
                    }
                }
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            },
        }
    }

    if let Some(handle) = interval_flush {
        handle.abort();
    }

    if let Some(sink) = &sink {
        drain_sink(sink, config.shutdown_timeout).await;
    }

    let summary = counters.take_summary();
    summary.log();
    info!(skipped = skipped, "Event bridge stopped");
}


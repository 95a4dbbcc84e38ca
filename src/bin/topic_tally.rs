//! Topic tally
//!
//! Subscribes to `MQTT_TOPIC` and keeps a cumulative message count per
//! topic, logging the table every `SUMMARY_INTERVAL_SECS`. Nothing is
//! stored.

use rumqttc::{Event, Packet};
use tokio::time::interval;
use tracing::{error, info};

use broker_sink_bridge::config::Config;
use broker_sink_bridge::mqtt::{self, ReconnectPause};
use broker_sink_bridge::shutdown::wait_for_signal;
use broker_sink_bridge::stats::TopicTally;
use broker_sink_bridge::telemetry::init_tracing;

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let (client, mut event_loop) = mqtt::connect(&config.mqtt);
    let mut tally = TopicTally::new();

    let mut summary = interval(config.summary_interval);
    let mut keep_alive = interval(config.mqtt.keep_alive_interval);
    summary.tick().await;
    keep_alive.tick().await;

    let mut reconnect = ReconnectPause::default();
    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            event = event_loop.poll(), if !reconnect.is_armed() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker");
                    if let Err(e) = mqtt::subscribe(&client, &config.mqtt) {
                        error!(error = %e, topic = %config.mqtt.topic, "Failed to subscribe");
                    }
                    mqtt::send_keep_alive(&client, &config.mqtt);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => tally.record(&publish.topic),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection error, retrying in {:?}", reconnect.delay());
                    reconnect.arm();
                }
            },

            _ = reconnect.elapsed(), if reconnect.is_armed() => {}

            _ = keep_alive.tick() => mqtt::send_keep_alive(&client, &config.mqtt),

            _ = summary.tick() => tally.log_summary(),
        }
    }

    tally.log_summary();
    mqtt::disconnect(&client, &mut event_loop, config.shutdown_timeout).await;
}

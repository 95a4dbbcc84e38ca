//! Keep-alive publisher
//!
//! Connects to the broker and publishes the keep-alive payload on
//! `MQTT_KEEP_ALIVE_TOPIC` when connected and every
//! `MQTT_KEEP_ALIVE_SECS` after that.

use std::time::Duration;

use rumqttc::{Event, Packet};
use tokio::time::interval;
use tracing::{error, info};

use broker_sink_bridge::config::Config;
use broker_sink_bridge::mqtt::{self, ReconnectPause};
use broker_sink_bridge::shutdown::wait_for_signal;
use broker_sink_bridge::telemetry::init_tracing;

/// Time allowed for the DISCONNECT to reach the broker
const DISCONNECT_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config.mqtt,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let (client, mut event_loop) = mqtt::connect(&config);

    let mut ticker = interval(config.keep_alive_interval);
    ticker.tick().await;

    let mut reconnect = ReconnectPause::default();
    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            event = event_loop.poll(), if !reconnect.is_armed() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %config.keep_alive_topic, "Connected, sending keep-alive");
                    mqtt::send_keep_alive(&client, &config);
                    sent += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "MQTT connection error, retrying in {:?}", reconnect.delay());
                    reconnect.arm();
                }
            },

            _ = reconnect.elapsed(), if reconnect.is_armed() => {}

            _ = ticker.tick() => {
                mqtt::send_keep_alive(&client, &config);
                sent += 1;
                info!(sent = sent, "Keep-alive sent");
            }
        }
    }

    mqtt::disconnect(&client, &mut event_loop, DISCONNECT_WAIT).await;
    info!(sent = sent, "Keep-alive publisher stopped");
}

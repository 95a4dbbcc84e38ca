//! MQTT connection setup and message-to-record mapping.
//!
//! Connection handling is left to `rumqttc`: the binaries poll the event
//! loop themselves so a single task sees every inbound publish, timer tick
//! and the shutdown signal.

use std::pin::Pin;
use std::time::Duration;

use chrono::Local;
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, QoS, Transport};
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info};

use crate::config::MqttConfig;

/// Columns written by the MQTT bridge.
pub const MQTT_COLUMNS: &[&str] = &["d", "t", "m"];

/// Payload of keep-alive publishes.
pub const KEEP_ALIVE_PAYLOAD: &[u8] = b"null";

/// Protocol-level keep-alive sent to the broker.
const PROTOCOL_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 100;

/// Pause before polling the event loop again after an error.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One stored MQTT message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttRecord {
    /// Local receive time, `YYYY-MM-DD HH:MM:SS`
    pub d: String,

    /// Topic with the leading levels removed
    pub t: String,

    /// Measurement value from the payload
    pub m: serde_json::Value,
}

impl MqttRecord {
    /// Map an inbound publish to a record stamped with the current local time.
    pub fn from_publish(topic: &str, payload: &[u8], strip_levels: usize) -> Self {
        Self::with_timestamp(local_timestamp(), topic, payload, strip_levels)
    }

    pub fn with_timestamp(
        d: impl Into<String>,
        topic: &str,
        payload: &[u8],
        strip_levels: usize,
    ) -> Self {
        Self {
            d: d.into(),
            t: strip_topic(topic, strip_levels),
            m: extract_value(payload),
        }
    }
}

/// Current local time as `YYYY-MM-DD HH:MM:SS`.
///
/// The zone follows `TZ`, e.g. `TZ=Australia/Sydney`.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Drop the first `levels` topic levels.
pub fn strip_topic(topic: &str, levels: usize) -> String {
    topic.split('/').skip(levels).collect::<Vec<_>>().join("/")
}

/// Pull the `value` field out of a JSON payload.
///
/// JSON without `value` maps to null; a payload that is not JSON is kept as
/// its (lossy UTF-8) text.
pub fn extract_value(payload: &[u8]) -> serde_json::Value {
    match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.remove("value").unwrap_or(serde_json::Value::Null)
        }
        Ok(_) => serde_json::Value::Null,
        Err(_) => serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()),
    }
}

/// Map a numeric QoS to the rumqttc level.
pub fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Build connection options from configuration.
pub fn options(config: &MqttConfig) -> MqttOptions {
    let mut mqtt_opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);

    mqtt_opts.set_keep_alive(PROTOCOL_KEEP_ALIVE);

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        mqtt_opts.set_credentials(username, password);
    }

    if config.tls {
        mqtt_opts.set_transport(Transport::tls_with_default_config());
    }

    mqtt_opts
}

/// Create the client and the event loop the caller must poll.
pub fn connect(config: &MqttConfig) -> (AsyncClient, EventLoop) {
    info!(
        host = %config.host,
        port = config.port,
        client_id = %config.client_id,
        tls = config.tls,
        "Connecting to MQTT broker"
    );
    AsyncClient::new(options(config), REQUEST_CHANNEL_CAPACITY)
}

/// Queue the subscription for the configured topic.
///
/// Uses the non-blocking request path because the caller is the task that
/// polls the event loop.
pub fn subscribe(client: &AsyncClient, config: &MqttConfig) -> Result<(), ClientError> {
    client.try_subscribe(config.topic.clone(), qos(config.qos))?;
    info!(topic = %config.topic, qos = config.qos, "Subscribed to topic");
    Ok(())
}

/// Queue a keep-alive publish.
pub fn send_keep_alive(client: &AsyncClient, config: &MqttConfig) {
    match client.try_publish(
        config.keep_alive_topic.clone(),
        qos(config.qos),
        false,
        KEEP_ALIVE_PAYLOAD,
    ) {
        Ok(()) => debug!(topic = %config.keep_alive_topic, "Keep-alive message sent"),
        Err(e) => error!(error = %e, "Error sending keep-alive message"),
    }
}

/// Pause armed after an event loop error.
///
/// The binaries stop polling the event loop while it is armed and wait on
/// [`ReconnectPause::elapsed`] as a `select!` branch, so a shutdown signal
/// is still seen during the pause.
pub struct ReconnectPause {
    delay: Duration,
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Default for ReconnectPause {
    fn default() -> Self {
        Self::new(RECONNECT_DELAY)
    }
}

impl ReconnectPause {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            sleep: Box::pin(tokio::time::sleep(Duration::ZERO)),
            armed: false,
        }
    }

    /// Start the pause.
    pub fn arm(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.delay);
        self.armed = true;
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Resolve once the armed pause has run out, then disarm.
    pub async fn elapsed(&mut self) {
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

/// Send DISCONNECT and keep polling until it is on the wire or `wait` runs out.
pub async fn disconnect(client: &AsyncClient, event_loop: &mut EventLoop, wait: Duration) {
    if let Err(e) = client.try_disconnect() {
        error!(error = %e, "Failed to queue MQTT disconnect");
        return;
    }

    let flushed = tokio::time::timeout(wait, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    match flushed {
        Ok(()) => info!("MQTT connection closed"),
        Err(_) => debug!("MQTT disconnect not confirmed before timeout"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use serde_json::json;

    #[test]
    fn test_strip_topic() {
        assert_eq!(strip_topic("org/site/line1/temp", 2), "line1/temp");
        assert_eq!(strip_topic("org/site", 2), "");
        assert_eq!(strip_topic("a/b/c", 0), "a/b/c");
    }

    #[test]
    fn test_extract_value_from_json() {
        assert_eq!(extract_value(br#"{"value": 21.5, "unit": "C"}"#), json!(21.5));
        assert_eq!(extract_value(br#"{"value": "on"}"#), json!("on"));
    }

    #[test]
    fn test_extract_value_missing_field() {
        assert_eq!(extract_value(br#"{"reading": 3}"#), serde_json::Value::Null);
        assert_eq!(extract_value(b"42"), serde_json::Value::Null);
    }

    #[test]
    fn test_extract_value_non_json_keeps_text() {
        assert_eq!(extract_value(b"door open"), json!("door open"));
    }

    #[test]
    fn test_record_from_publish() {
        let record =
            MqttRecord::with_timestamp("2024-05-01 09:30:00", "acme/plant/press/pressure", br#"{"value":7}"#, 2);

        assert_eq!(record.t, "press/pressure");
        assert_eq!(record.m, json!(7));

        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(
            encoded,
            json!({"d": "2024-05-01 09:30:00", "t": "press/pressure", "m": 7})
        );
    }

    #[test]
    fn test_local_timestamp_format() {
        let ts = local_timestamp();
        assert_eq!(ts.len(), 19);
        assert!(chrono::NaiveDateTime::parse_from_str(&ts, "%Y-%m-%d %H:%M:%S").is_ok());
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_reconnect_pause() {
        let mut pause = ReconnectPause::new(Duration::from_millis(20));
        assert!(!pause.is_armed());

        pause.arm();
        assert!(pause.is_armed());

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(1), pause.elapsed())
            .await
            .expect("pause should run out");
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert!(!pause.is_armed());
    }

    #[tokio::test]
    async fn test_reconnect_pause_yields_to_other_branches() {
        let mut pause = ReconnectPause::new(Duration::from_secs(30));
        pause.arm();

        let stopped = tokio::select! {
            _ = pause.elapsed(), if pause.is_armed() => false,
            _ = tokio::time::sleep(Duration::from_millis(10)) => true,
        };
        assert!(stopped);
        assert!(pause.is_armed());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default().mqtt;
        config.client_id = "bridge-test".to_string();
        config.host = "broker.local".to_string();
        config.port = 1884;

        let opts = options(&config);
        assert_eq!(opts.client_id(), "bridge-test");
        assert_eq!(opts.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(opts.keep_alive(), PROTOCOL_KEEP_ALIVE);
    }
}

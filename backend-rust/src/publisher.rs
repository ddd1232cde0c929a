//! MQTT-style telemetry publisher: connection lifecycle, exponential backoff
//! on transient failures, and fan-out of a payload into per-metric topics.

use std::collections::HashMap;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("publish not acknowledged within timeout for topic {0}")]
    AckTimeout(String),
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub qos: QoS,
    pub retain: bool,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "subaru-telemetry".to_string(),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            qos: QoS::AtLeastOnce,
            retain: false,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Tracks the exponential backoff used while the publisher is degraded,
/// mirroring `backoff = min(backoff_max, backoff * 1.5)` on failure and a
/// reset to `backoff_min` on success.
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { current: min, min, max }
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }

    pub fn current(&self) -> Duration {
        self.current.min(self.max)
    }

    pub fn grow(&mut self) -> Duration {
        let delay = self.current();
        let grown = self.current.mul_f64(1.5);
        self.current = grown.min(self.max).max(self.min);
        delay
    }
}

pub struct Publisher {
    client: AsyncClient,
    config: PublisherConfig,
}

impl Publisher {
    pub fn connect(config: PublisherConfig) -> (Self, rumqttc::EventLoop) {
        let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
        opts.set_keep_alive(config.keep_alive);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            opts.set_credentials(user.clone(), pass.clone());
        }
        let (client, eventloop) = AsyncClient::new(opts, 100);
        (Self { client, config }, eventloop)
    }

    async fn publish_checked(&self, topic: &str, payload: String, retain: bool, ack_timeout: Duration) -> Result<(), PublishError> {
        let client = self.client.clone();
        let topic_owned = topic.to_string();
        let publish_fut = client.publish(topic, self.config.qos, retain, payload);
        tokio::time::timeout(ack_timeout, publish_fut)
            .await
            .map_err(|_| PublishError::AckTimeout(topic_owned))??;
        Ok(())
    }

    /// Publishes the full telemetry payload to `{base}/data`, then fans each
    /// entry of `payload["metrics"]` out to `{base}/<topic_slug>`.
    pub async fn publish_payload_and_metrics(&self, base_topic: &str, payload: &Value) -> Result<(), PublishError> {
        let body = serde_json::to_string(payload).unwrap_or_default();
        self.publish_checked(&format!("{base_topic}/data"), body, self.config.retain, Duration::from_secs(5))
            .await?;

        if let Some(metrics) = payload.get("metrics").and_then(Value::as_object) {
            for (topic_slug, value) in metrics {
                let rendered = scalar_to_string(value);
                self.publish_checked(&format!("{base_topic}/{topic_slug}"), rendered, self.config.retain, Duration::from_secs(5))
                    .await?;
            }
        }
        Ok(())
    }

    /// Publishes a retained status/heartbeat payload with a tighter ack
    /// timeout than full telemetry frames.
    pub async fn publish_status(&self, status_topic: &str, status: &HashMap<String, Value>) -> Result<(), PublishError> {
        let body = serde_json::to_string(status).unwrap_or_default();
        self.publish_checked(status_topic, body, true, Duration::from_secs(3)).await
    }

    /// Publishes a retained snapshot payload (e.g. a DTC read) to an exact
    /// topic, with no `/data` suffix and no per-metric fan-out.
    pub async fn publish_retained(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        let body = serde_json::to_string(payload).unwrap_or_default();
        self.publish_checked(topic, body, true, Duration::from_secs(5)).await
    }

    /// Publishes a single flat event object (lap/split) to an exact topic,
    /// unretained, with no `/data` suffix and no per-metric fan-out.
    pub async fn publish_event(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        let body = serde_json::to_string(payload).unwrap_or_default();
        self.publish_checked(topic, body, false, Duration::from_secs(5)).await
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Drives `eventloop.poll()` forever, logging connection transitions. Meant
/// to be spawned as its own task alongside the publishing side.
pub async fn drive_eventloop(mut eventloop: rumqttc::EventLoop, connected: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, std::sync::atomic::Ordering::SeqCst);
                info!("mqtt connected");
            }
            Ok(_) => {}
            Err(err) => {
                connected.store(false, std::sync::atomic::Ordering::SeqCst);
                warn!(error = %err, "mqtt eventloop error");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_by_one_point_five_and_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let d1 = backoff.grow();
        assert_eq!(d1, Duration::from_millis(100));
        let d2 = backoff.grow();
        assert_eq!(d2, Duration::from_millis(150));
        for _ in 0..20 {
            backoff.grow();
        }
        assert_eq!(backoff.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_reset_returns_to_minimum() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        backoff.grow();
        backoff.grow();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(100));
    }

    #[test]
    fn test_scalar_to_string_renders_strings_without_quotes() {
        assert_eq!(scalar_to_string(&Value::String("afr".to_string())), "afr");
        assert_eq!(scalar_to_string(&serde_json::json!(1.5)), "1.5");
    }
}

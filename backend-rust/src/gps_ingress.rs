//! MQTT subscriber that feeds GPS fixes into `HudState`, publishing any
//! resulting split/lap events and InfluxDB points once the lock is released.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::hud_state::{HudEvent, HudState};
use crate::influx::InfluxWriter;
use crate::publisher::Publisher;

pub struct GpsIngressConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub gps_topic: String,
    pub events_topic_base: String,
}

pub async fn run(config: GpsIngressConfig, hud: Arc<HudState>, publisher: Option<Arc<Publisher>>, influx: Arc<InfluxWriter>) {
    loop {
        if let Err(err) = run_once(&config, &hud, publisher.as_deref(), &influx).await {
            warn!(error = %err, "gps ingress connection lost, reconnecting");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

async fn run_once(
    config: &GpsIngressConfig,
    hud: &Arc<HudState>,
    publisher: Option<&Publisher>,
    influx: &InfluxWriter,
) -> Result<(), rumqttc::ConnectionError> {
    let mut opts = MqttOptions::new(config.client_id.clone(), config.host.clone(), config.port);
    opts.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(opts, 100);
    client.subscribe(config.gps_topic.as_str(), QoS::AtMostOnce).await.ok();
    info!(topic = %config.gps_topic, "gps ingress subscribed");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                handle_message(&publish.payload, hud, publisher, influx, &config.events_topic_base).await;
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("gps ingress connected");
            }
            Ok(_) => {}
            Err(err) => return Err(err),
        }
    }
}

async fn handle_message(payload: &[u8], hud: &Arc<HudState>, publisher: Option<&Publisher>, influx: &InfluxWriter, events_topic_base: &str) {
    let fix: crate::hud_state::GpsFix = match serde_json::from_slice(payload) {
        Ok(fix) => fix,
        Err(err) => {
            warn!(error = %err, "malformed gps fix payload, dropping");
            return;
        }
    };

    let events = hud.update(&fix);
    for event in events {
        match event {
            HudEvent::Split(split) => {
                debug!(driver = %split.driver, idx = split.split_index, "split captured");
                if let Some(publisher) = publisher {
                    let topic = format!("{}/{}/splits", events_topic_base.trim_matches('/'), split.driver);
                    let payload = json!({
                        "event": "split",
                        "driver": split.driver,
                        "session_id": split.session_id,
                        "lap_number": split.lap_number,
                        "split_index": split.split_index,
                        "split_cumulative_sec": split.split_cumulative_sec,
                        "split_segment_sec": split.split_segment_sec,
                        "ts_ns": split.ts_ns,
                    });
                    let _ = publisher.publish_event(&topic, &payload).await;
                }
                influx
                    .write(
                        "driver_splits",
                        &[("driver", split.driver.clone()), ("session_id", split.session_id.to_string()), ("split_index", split.split_index.to_string())],
                        &[
                            ("lap_number", json!(split.lap_number)),
                            ("split_cumulative_sec", json!(split.split_cumulative_sec)),
                            ("split_segment_sec", json!(split.split_segment_sec)),
                        ],
                        split.ts_ns,
                    )
                    .await;
            }
            HudEvent::Lap(lap) => {
                info!(driver = %lap.driver, lap_time = lap.lap_time_sec, "lap completed");
                if let Some(publisher) = publisher {
                    let topic = format!("{}/{}/laps", events_topic_base.trim_matches('/'), lap.driver);
                    let payload = json!({
                        "event": "lap",
                        "driver": lap.driver,
                        "session_id": lap.session_id,
                        "lap_number": lap.lap_number,
                        "lap_time_sec": lap.lap_time_sec,
                        "splits_sec": lap.splits_sec,
                        "completed_at_sec": lap.completed_at_sec,
                    });
                    let _ = publisher.publish_event(&topic, &payload).await;
                }
                influx
                    .write(
                        "driver_laps",
                        &[("driver", lap.driver.clone()), ("session_id", lap.session_id.to_string())],
                        &[
                            ("lap_number", json!(lap.lap_number)),
                            ("lap_time_sec", json!(lap.lap_time_sec)),
                            ("split_1_sec", json!(lap.splits_sec[0])),
                            ("split_2_sec", json!(lap.splits_sec[1])),
                            ("split_3_sec", json!(lap.splits_sec[2])),
                        ],
                        (lap.completed_at_sec * 1_000_000_000.0) as i64,
                    )
                    .await;
            }
        }
    }
}

//! Optional InfluxDB line-protocol sink for split/lap events. POST failures
//! are rate-limited to avoid flooding logs when the database is unreachable.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub enabled: bool,
    pub url: String,
    pub db: String,
    pub timeout: Duration,
    pub v2_bucket: String,
    pub v2_org: String,
    pub v2_token: String,
    pub v1_user: String,
    pub v1_password: String,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            db: "subaru".to_string(),
            timeout: Duration::from_millis(1200),
            v2_bucket: String::new(),
            v2_org: String::new(),
            v2_token: String::new(),
            v1_user: String::new(),
            v1_password: String::new(),
        }
    }
}

pub struct InfluxWriter {
    config: InfluxConfig,
    client: reqwest::Client,
    last_error_log: Mutex<Option<Instant>>,
}

fn esc_tag(v: &str) -> String {
    v.replace('\\', "\\\\").replace(',', "\\,").replace(' ', "\\ ").replace('=', "\\=")
}

fn esc_field_str(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"")
}

fn field_value(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "true".to_string() } else { "false".to_string() }),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(format!("{n}i"))
            } else {
                Some(n.to_string())
            }
        }
        Value::String(s) => Some(format!("\"{}\"", esc_field_str(s))),
        other => Some(format!("\"{}\"", esc_field_str(&other.to_string()))),
    }
}

impl InfluxWriter {
    pub fn new(config: InfluxConfig) -> Self {
        let client = reqwest::Client::builder().timeout(config.timeout).build().unwrap_or_default();
        Self { config, client, last_error_log: Mutex::new(None) }
    }

    fn build_line(&self, measurement: &str, tags: &[(&str, String)], fields: &[(&str, Value)], ts_ns: i64) -> Option<String> {
        let tag_part: String = tags
            .iter()
            .map(|(k, v)| format!(",{}={}", esc_tag(k), esc_tag(v)))
            .collect();

        let field_chunks: Vec<String> = fields
            .iter()
            .filter_map(|(k, v)| field_value(v).map(|rendered| format!("{}={}", esc_tag(k), rendered)))
            .collect();
        if field_chunks.is_empty() {
            return None;
        }

        Some(format!("{}{} {} {}", esc_tag(measurement), tag_part, field_chunks.join(","), ts_ns))
    }

    fn endpoint(&self) -> (String, Vec<(String, String)>, Option<String>) {
        if !self.config.v2_bucket.is_empty() && !self.config.v2_org.is_empty() {
            let mut params = vec![
                ("org".to_string(), self.config.v2_org.clone()),
                ("bucket".to_string(), self.config.v2_bucket.clone()),
                ("precision".to_string(), "ns".to_string()),
            ];
            let auth = if !self.config.v2_token.is_empty() {
                Some(format!("Token {}", self.config.v2_token))
            } else {
                None
            };
            (format!("{}/api/v2/write", self.config.url.trim_end_matches('/')), params.drain(..).collect(), auth)
        } else {
            let mut params = vec![("db".to_string(), self.config.db.clone()), ("precision".to_string(), "ns".to_string())];
            if !self.config.v1_user.is_empty() {
                params.push(("u".to_string(), self.config.v1_user.clone()));
            }
            if !self.config.v1_password.is_empty() {
                params.push(("p".to_string(), self.config.v1_password.clone()));
            }
            (format!("{}/write", self.config.url.trim_end_matches('/')), params, None)
        }
    }

    pub async fn write(&self, measurement: &str, tags: &[(&str, String)], fields: &[(&str, Value)], ts_ns: i64) {
        if !self.config.enabled {
            return;
        }
        let Some(line) = self.build_line(measurement, tags, fields, ts_ns) else {
            return;
        };

        let (url, params, auth) = self.endpoint();
        let mut req = self.client.post(&url).query(&params).header("Content-Type", "text/plain; charset=utf-8").body(line);
        if let Some(token) = auth {
            req = req.header("Authorization", token);
        }

        if let Err(err) = req.send().await {
            self.log_rate_limited(&err.to_string());
        }
    }

    fn log_rate_limited(&self, message: &str) {
        let mut last = self.last_error_log.lock().unwrap();
        let should_log = last.map(|t| t.elapsed() >= Duration::from_secs(10)).unwrap_or(true);
        if should_log {
            warn!(error = message, "influx write failed");
            *last = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> InfluxWriter {
        InfluxWriter::new(InfluxConfig { enabled: true, url: "http://localhost:8086".to_string(), ..InfluxConfig::default() })
    }

    #[test]
    fn test_build_line_escapes_tag_values_and_formats_integer_fields() {
        let w = writer();
        let line = w
            .build_line(
                "driver_splits",
                &[("driver", "Mario Kart".to_string())],
                &[("lap_number", serde_json::json!(3)), ("split_cumulative_sec", serde_json::json!(41.2))],
                1_700_000_000_000_000_000,
            )
            .unwrap();
        assert!(line.starts_with("driver_splits,driver=Mario\\ Kart "));
        assert!(line.contains("lap_number=3i"));
        assert!(line.contains("split_cumulative_sec=41.2"));
        assert!(line.ends_with("1700000000000000000"));
    }

    #[test]
    fn test_build_line_returns_none_when_all_fields_are_null() {
        let w = writer();
        let line = w.build_line("driver_laps", &[], &[("lap_time_sec", Value::Null)], 1);
        assert!(line.is_none());
    }

    #[test]
    fn test_v2_endpoint_selected_when_bucket_and_org_configured() {
        let w = InfluxWriter::new(InfluxConfig {
            enabled: true,
            url: "http://localhost:8086".to_string(),
            v2_bucket: "racing".to_string(),
            v2_org: "team".to_string(),
            v2_token: "secret".to_string(),
            ..InfluxConfig::default()
        });
        let (url, params, auth) = w.endpoint();
        assert!(url.ends_with("/api/v2/write"));
        assert!(params.iter().any(|(k, v)| k == "bucket" && v == "racing"));
        assert_eq!(auth, Some("Token secret".to_string()));
    }

    #[test]
    fn test_v1_endpoint_selected_by_default() {
        let w = writer();
        let (url, params, auth) = w.endpoint();
        assert!(url.ends_with("/write"));
        assert!(params.iter().any(|(k, v)| k == "db" && v == "subaru"));
        assert!(auth.is_none());
    }
}

//! Sample/publish orchestration: Init/Run/Degraded state machine driving the
//! serial read, spool flush, and publish cycle at a fixed cadence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::dtc::{self, DtcCatalog};
use crate::param_catalog::{decode_rr_params, ParamCatalog, ParamDef};
use crate::publisher::{Backoff, Publisher};
use crate::spool::Spool;
use crate::ssm2::{read_chunked, ChunkedReadOptions, RomIdentity, SSM2Client, SerialLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    Running,
    Degraded,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    pub samples_total: u64,
    pub samples_ok: u64,
    pub samples_spooled: u64,
    pub samples_failed: u64,
    pub serial_failures: u64,
    pub mqtt_failures: u64,
    pub dtc_polls_ok: u64,
    pub dtc_polls_failed: u64,
    pub last_error: String,
}

pub struct TelemetryLoopConfig {
    pub serial_path: String,
    pub baud_rate: u32,
    pub ecu_addr: u8,
    pub pad_addr: u8,
    pub period: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub chunk_size: usize,
    pub read_retries: u32,
    pub read_inter_delay: Duration,
    pub flush_per_loop: usize,
    pub dtc_interval: Duration,
    pub status_interval: Duration,
    pub base_topic: String,
    pub status_topic: String,
    pub dtc_topic: String,
    pub profile: String,
    pub state_file: PathBuf,
}

/// `sleep_for = period − elapsed`, clamped at zero so a slow sample never
/// produces a negative sleep and the loop naturally catches up without
/// oversleep drift.
pub fn next_sleep(period: Duration, elapsed: Duration) -> Duration {
    period.checked_sub(elapsed).unwrap_or(Duration::ZERO)
}

/// Replays up to `max_lines` spool head lines in order, stopping at the
/// first publish failure. Malformed JSON lines are treated as sent (dropped)
/// so a single poison line can't wedge the queue. Returns the count of lines
/// that should be dropped from the spool head.
pub async fn flush_spool(spool: &Spool, publisher: &Publisher, base_topic: &str, max_lines: usize) -> usize {
    let lines = match spool.peek(max_lines) {
        Ok(lines) => lines,
        Err(err) => {
            warn!(error = %err, "spool peek failed");
            return 0;
        }
    };
    if lines.is_empty() {
        return 0;
    }

    let mut sent = 0;
    for line in &lines {
        let payload: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => {
                sent += 1;
                continue;
            }
        };
        match publisher.publish_payload_and_metrics(base_topic, &payload).await {
            Ok(()) => sent += 1,
            Err(_) => break,
        }
    }
    sent
}

pub struct ActiveEcu {
    pub identity: RomIdentity,
    pub ecu_name: String,
    pub params: Vec<ParamDef>,
    pub addresses: Vec<u32>,
    pub dtc_catalog: Option<DtcCatalog>,
    pub dtc_pairs: Vec<(u32, u32)>,
    pub dtc_fmt_obd2: bool,
}

/// Handshakes with the ECU, loads the parameter set for its ROM id, and
/// enumerates DTC address pairs. Any failure here leaves the loop Degraded.
pub async fn init_ecu(
    client: &mut SSM2Client<SerialLink>,
    catalog: &ParamCatalog,
    dtc_defs_source: Option<&str>,
    profile: &str,
) -> anyhow::Result<ActiveEcu> {
    let identity = client.get_cu_data(Duration::from_millis(500))?;
    let (ecu_name, params) = catalog.params_for_rom(&identity.rom_id_hex(), profile)?;
    if params.is_empty() {
        anyhow::bail!("no supported RomRaider parameters found for this ROM");
    }

    let mut addresses: Vec<u32> = params.iter().flat_map(|p| (0..p.size as u32).map(move |i| p.addr + i)).collect();
    addresses.sort_unstable();
    addresses.dedup();

    let (dtc_fmt_obd2, dtc_pairs) = dtc::enumerate_supported_dtc_addr_pairs(&identity.flagbytes);
    let dtc_catalog = dtc_defs_source.and_then(|source| {
        let symbol = dtc::symbol_for_format(dtc_fmt_obd2);
        DtcCatalog::parse_defs(source, symbol).ok()
    });

    Ok(ActiveEcu { identity, ecu_name, params, addresses, dtc_catalog, dtc_pairs, dtc_fmt_obd2 })
}

/// Reads the current chunk of addresses and decodes them into a telemetry
/// sample payload ready for the spool/publisher.
pub fn build_sample(seq: u64, ecu: &ActiveEcu, values: &HashMap<u32, u8>, profile: &str) -> Value {
    let (metrics, units) = decode_rr_params(&ecu.params, values);
    let ts_epoch = unix_time_now();
    json!({
        "seq": seq,
        "ts_iso": iso8601_utc(ts_epoch),
        "ts_epoch": ts_epoch,
        "sys_id": ecu.identity.sys_id_hex(),
        "rom_id": ecu.identity.rom_id_hex(),
        "ecu_name": ecu.ecu_name,
        "profile": profile,
        "metrics": metrics,
        "units": units,
    })
}

/// Formats a Unix epoch timestamp (seconds) as a UTC `YYYY-MM-DDTHH:MM:SS.sssZ`
/// string using the civil-from-days algorithm, with no calendar crate.
fn iso8601_utc(ts_epoch: f64) -> String {
    let millis_total = (ts_epoch * 1000.0).round() as i64;
    let days = millis_total.div_euclid(86_400_000);
    let ms_of_day = millis_total.rem_euclid(86_400_000);

    let (year, month, day) = civil_from_days(days);
    let hour = ms_of_day / 3_600_000;
    let minute = (ms_of_day / 60_000) % 60;
    let second = (ms_of_day / 1000) % 60;
    let millis = ms_of_day % 1000;

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z")
}

/// Howard Hinnant's days-since-epoch to Gregorian civil date algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if m <= 2 { y + 1 } else { y };
    (year, m, d)
}

pub fn read_sample(client: &mut SSM2Client<SerialLink>, ecu: &ActiveEcu, config: &TelemetryLoopConfig) -> anyhow::Result<HashMap<u32, u8>> {
    let opts = ChunkedReadOptions {
        chunk_size: config.chunk_size,
        retries: config.read_retries,
        inter_delay: config.read_inter_delay,
        timeout: Duration::from_millis(500),
        best_effort: true,
    };
    Ok(read_chunked(client, &ecu.addresses, &opts)?)
}

pub fn write_state_file(path: &std::path::Path, state: LoopState, connected: bool, spool_depth: usize, stats: &LoopStats) {
    let payload = json!({
        "ts_epoch": unix_time_now(),
        "status": match state {
            LoopState::Init => "init",
            LoopState::Running => "running",
            LoopState::Degraded => "degraded",
        },
        "mqtt_connected": connected,
        "spool_depth": spool_depth,
        "stats": stats,
    });
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let tmp = path.with_extension("tmp");
    let rendered = serde_json::to_string(&payload).unwrap_or_default();
    if std::fs::write(&tmp, rendered).and_then(|_| std::fs::rename(&tmp, path)).is_err() {
        error!(path = %path.display(), "failed to write heartbeat state file");
    }
}

/// Drives independent monotonic cadences (DTC polling, status heartbeat)
/// alongside the sample loop. Each cadence tracks its own `Instant` so a
/// slow sample tick never starves the others.
pub struct Cadence {
    interval: Duration,
    last_fired: Instant,
}

impl Cadence {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last_fired: Instant::now() - interval }
    }

    pub fn due(&self, now: Instant) -> bool {
        now.duration_since(self.last_fired) >= self.interval
    }

    pub fn mark_fired(&mut self, now: Instant) {
        self.last_fired = now;
    }
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_sleep_never_negative_when_sample_overruns_period() {
        let period = Duration::from_millis(100);
        let elapsed = Duration::from_millis(150);
        assert_eq!(next_sleep(period, elapsed), Duration::ZERO);
    }

    #[test]
    fn test_next_sleep_returns_remainder_when_sample_is_fast() {
        let period = Duration::from_millis(100);
        let elapsed = Duration::from_millis(30);
        assert_eq!(next_sleep(period, elapsed), Duration::from_millis(70));
    }

    #[test]
    fn test_cadence_not_due_until_interval_elapses() {
        let cadence = Cadence::new(Duration::from_secs(300));
        assert!(cadence.due(Instant::now()));
    }

    #[test]
    fn test_cadence_mark_fired_resets_due_check() {
        let mut cadence = Cadence::new(Duration::from_millis(50));
        let now = Instant::now();
        cadence.mark_fired(now);
        assert!(!cadence.due(now));
    }

    #[test]
    fn test_build_sample_includes_seq_and_identity() {
        let ecu = ActiveEcu {
            identity: RomIdentity { sys_id: [0xAA, 0xBB, 0xCC], rom_id: [0x41, 0x42, 0x43, 0x44, 0x45], flagbytes: vec![0, 1, 2] },
            ecu_name: "WRX STI".to_string(),
            params: Vec::new(),
            addresses: Vec::new(),
            dtc_catalog: None,
            dtc_pairs: Vec::new(),
            dtc_fmt_obd2: true,
        };
        let sample = build_sample(7, &ecu, &HashMap::new(), "fast");
        assert_eq!(sample["seq"], 7);
        assert_eq!(sample["rom_id"], "4142434445");
        assert_eq!(sample["profile"], "fast");
        assert_eq!(sample["ecu_name"], "WRX STI");
        assert!(sample["ts_iso"].as_str().unwrap().ends_with('Z'));
        assert_eq!(sample["metrics"].as_object().unwrap().len(), sample["units"].as_object().unwrap().len());
    }

    #[test]
    fn test_iso8601_utc_formats_known_instant() {
        // 2024-01-01T00:00:00.000Z
        assert_eq!(iso8601_utc(1_704_067_200.0), "2024-01-01T00:00:00.000Z");
    }
}

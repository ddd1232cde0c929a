//! Driver-scoped lap records, persisted as a single JSON document with an
//! atomic (temp-file + rename) write path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lap_timing::{split_segments, MIN_VALID_LAP_SEC};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LapRow {
    pub lap_number: u32,
    pub lap_time_sec: f64,
    pub splits_sec: [Option<f64>; 3],
    pub completed_at_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Session {
    pub laps: Vec<LapRow>,
    pub created_at_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    pub current_session_id: u32,
    pub sessions: HashMap<String, Session>,
}

impl DriverRecord {
    fn empty(now: f64) -> Self {
        let mut sessions = HashMap::new();
        sessions.insert("1".to_string(), Session { laps: Vec::new(), created_at_sec: now });
        Self { current_session_id: 1, sessions }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RecordsDoc {
    drivers: HashMap<String, DriverRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct Benchmarks {
    pub best_lap_sec: Option<f64>,
    pub best_splits_sec: [Option<f64>; 3],
    pub best_split_segments_sec: [Option<f64>; 3],
}

#[derive(Debug, Clone, Default)]
pub struct RecentLap {
    pub last_lap_sec: Option<f64>,
    pub last_splits_sec: [Option<f64>; 3],
    pub lap_count: u32,
}

pub struct RecordsStore {
    path: PathBuf,
    doc: RecordsDoc,
    now_fn: fn() -> f64,
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl RecordsStore {
    pub fn load(path: impl Into<PathBuf>, known_drivers: &[String]) -> Self {
        Self::load_with_clock(path, known_drivers, unix_time_now)
    }

    fn load_with_clock(path: impl Into<PathBuf>, known_drivers: &[String], now_fn: fn() -> f64) -> Self {
        let path = path.into();
        let mut doc = if path.exists() {
            match fs::read_to_string(&path).and_then(|s| serde_json::from_str::<RecordsDoc>(&s).map_err(Into::into)) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "records file unreadable, starting fresh");
                    RecordsDoc::default()
                }
            }
        } else {
            RecordsDoc::default()
        };

        for name in known_drivers {
            doc.drivers.entry(name.clone()).or_insert_with(|| DriverRecord::empty(now_fn()));
        }

        Self { path, doc, now_fn }
    }

    fn ensure_driver(&mut self, driver: &str) {
        if !self.doc.drivers.contains_key(driver) {
            self.doc.drivers.insert(driver.to_string(), DriverRecord::empty((self.now_fn)()));
        }
    }

    fn persist(&self) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(&sorted(&self.doc))?;
        let tmp_path = sibling_tmp_path(&self.path);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&tmp_path, json)?;
        fs::rename(&tmp_path, &self.path)
    }

    pub fn current_session_id(&mut self, driver: &str) -> u32 {
        self.ensure_driver(driver);
        self.doc.drivers[driver].current_session_id
    }

    pub fn add_lap(&mut self, driver: &str, lap: LapRow) -> std::io::Result<()> {
        self.ensure_driver(driver);
        let session_id = self.current_session_id(driver).to_string();
        let now = (self.now_fn)();
        let record = self.doc.drivers.get_mut(driver).unwrap();
        let session = record.sessions.entry(session_id).or_insert_with(|| Session { laps: Vec::new(), created_at_sec: now });
        session.laps.push(lap);
        self.persist()
    }

    pub fn reset_session(&mut self, driver: &str) -> std::io::Result<u32> {
        self.ensure_driver(driver);
        let now = (self.now_fn)();
        let record = self.doc.drivers.get_mut(driver).unwrap();
        let next_id = record.current_session_id + 1;
        record.current_session_id = next_id;
        record.sessions.insert(next_id.to_string(), Session { laps: Vec::new(), created_at_sec: now });
        self.persist()?;
        Ok(next_id)
    }

    pub fn benchmarks(&mut self, driver: &str) -> Benchmarks {
        self.ensure_driver(driver);
        let record = &self.doc.drivers[driver];
        let mut best_lap: Option<f64> = None;
        let mut best_splits = [None; 3];
        let mut best_segments = [None; 3];

        for session in record.sessions.values() {
            for lap in &session.laps {
                if lap.lap_time_sec < MIN_VALID_LAP_SEC {
                    continue;
                }
                if best_lap.map(|b| lap.lap_time_sec < b).unwrap_or(true) {
                    best_lap = Some(lap.lap_time_sec);
                }
                for i in 0..3 {
                    if let Some(v) = lap.splits_sec[i].filter(|&v| v > 0.0) {
                        if best_splits[i].map(|b| v < b).unwrap_or(true) {
                            best_splits[i] = Some(v);
                        }
                    }
                }
                let segments = split_segments(lap.splits_sec);
                for i in 0..3 {
                    if let Some(seg) = segments[i] {
                        if best_segments[i].map(|b| seg < b).unwrap_or(true) {
                            best_segments[i] = Some(seg);
                        }
                    }
                }
            }
        }

        Benchmarks { best_lap_sec: best_lap, best_splits_sec: best_splits, best_split_segments_sec: best_segments }
    }

    pub fn recent(&mut self, driver: &str) -> RecentLap {
        self.ensure_driver(driver);
        let current_id = self.current_session_id(driver).to_string();
        let record = &self.doc.drivers[driver];

        let mut lap_count = 0;
        let mut latest: Option<&LapRow> = None;

        if let Some(current) = record.sessions.get(&current_id) {
            lap_count = current.laps.len() as u32;
            latest = current.laps.last();
        }

        if latest.is_none() {
            let mut latest_ts = -1.0;
            for session in record.sessions.values() {
                for lap in &session.laps {
                    if lap.completed_at_sec > latest_ts {
                        latest_ts = lap.completed_at_sec;
                        latest = Some(lap);
                    }
                }
            }
        }

        match latest {
            None => RecentLap { last_lap_sec: None, last_splits_sec: [None; 3], lap_count },
            Some(lap) => RecentLap {
                last_lap_sec: Some(lap.lap_time_sec).filter(|&v| v > 0.0),
                last_splits_sec: lap.splits_sec.map(|v| v.filter(|&x| x > 0.0)),
                lap_count,
            },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the stored sessions for a driver, keyed by session id, or
    /// `None` if the driver has never been seen.
    pub fn driver_sessions(&self, driver: &str) -> Option<&HashMap<String, Session>> {
        self.doc.drivers.get(driver).map(|record| &record.sessions)
    }
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Recursively sorts map keys so `serde_json::to_string_pretty` output is
/// key-sorted (HashMap iteration order is otherwise unspecified).
fn sorted(doc: &RecordsDoc) -> serde_json::Value {
    let mut value = serde_json::to_value(doc).expect("RecordsDoc always serializes");
    sort_object_keys(&mut value);
    value
}

fn sort_object_keys(value: &mut serde_json::Value) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.iter_mut().map(|(k, v)| (k.clone(), std::mem::take(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            map.clear();
            for (k, mut v) in entries {
                sort_object_keys(&mut v);
                map.insert(k, v);
            }
        }
        Value::Array(items) => {
            for item in items {
                sort_object_keys(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> f64 {
        1_700_000_000.0
    }

    fn temp_store(drivers: &[String]) -> RecordsStore {
        let id = std::process::id();
        let n = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().subsec_nanos();
        let path = std::env::temp_dir().join(format!("subaru_records_test_{id}_{n}.json"));
        let _ = fs::remove_file(&path);
        RecordsStore::load_with_clock(path, drivers, fixed_now)
    }

    fn lap(number: u32, time: f64, splits: [Option<f64>; 3], completed_at: f64) -> LapRow {
        LapRow { lap_number: number, lap_time_sec: time, splits_sec: splits, completed_at_sec: completed_at }
    }

    #[test]
    fn test_add_lap_persists_to_disk_and_survives_reload() {
        let mut store = temp_store(&["driver_a".to_string()]);
        let path = store.path().to_path_buf();
        store.add_lap("driver_a", lap(1, 95.0, [Some(30.0), Some(62.0), Some(95.0)], 100.0)).unwrap();

        let reloaded = RecordsStore::load_with_clock(path, &["driver_a".to_string()], fixed_now);
        let laps = &reloaded.doc.drivers["driver_a"].sessions["1"].laps;
        assert_eq!(laps.len(), 1);
        assert_eq!(laps[0].lap_number, 1);
    }

    #[test]
    fn test_reset_session_starts_empty_session_and_bumps_id() {
        let mut store = temp_store(&["driver_a".to_string()]);
        store.add_lap("driver_a", lap(1, 95.0, [None, None, Some(95.0)], 100.0)).unwrap();
        let new_id = store.reset_session("driver_a").unwrap();
        assert_eq!(new_id, 2);
        let recent = store.recent("driver_a");
        assert_eq!(recent.lap_count, 0);
    }

    #[test]
    fn test_benchmarks_ignore_laps_below_minimum_valid_duration() {
        let mut store = temp_store(&["driver_a".to_string()]);
        store.add_lap("driver_a", lap(1, 10.0, [Some(3.0), Some(6.0), Some(10.0)], 100.0)).unwrap();
        store.add_lap("driver_a", lap(2, 95.0, [Some(30.0), Some(62.0), Some(95.0)], 200.0)).unwrap();
        let bench = store.benchmarks("driver_a");
        assert_eq!(bench.best_lap_sec, Some(95.0));
    }

    #[test]
    fn test_recent_falls_back_to_global_latest_when_current_session_empty() {
        let mut store = temp_store(&["driver_a".to_string()]);
        store.add_lap("driver_a", lap(1, 95.0, [Some(30.0), Some(62.0), Some(95.0)], 100.0)).unwrap();
        store.reset_session("driver_a").unwrap();
        let recent = store.recent("driver_a");
        assert_eq!(recent.last_lap_sec, Some(95.0));
        assert_eq!(recent.lap_count, 0);
    }
}

//! Mutex-protected shared dashboard state: latest sample, history ring, and
//! per-driver lap timing. Projection and timing updates happen inside the
//! lock; any network publish happens after it is released.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;

use crate::lap_timing::{LapSnapshot, LapTiming};
use crate::records_store::{LapRow, RecordsStore};
use crate::track_geometry::{LatLon, TrackGeometry};

pub const MAX_TRACK_ERROR_M: f64 = 120.0;

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct GpsFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub ts_ns: Option<i64>,
    #[serde(default)]
    pub fixq: Option<i32>,
    #[serde(default)]
    pub sats: Option<i32>,
    #[serde(default)]
    pub hdop: Option<f64>,
    #[serde(default)]
    pub alt_m: Option<f64>,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default)]
    pub track_deg: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrailPoint {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestRow {
    pub lat: f64,
    pub lon: f64,
    pub driver: String,
    pub track_s_m: f64,
    pub track_error_m: f64,
    pub lap_distance_m: Option<f64>,
    pub ts_ns: i64,
}

#[derive(Debug, Clone)]
pub struct SplitEvent {
    pub driver: String,
    pub session_id: u32,
    pub lap_number: u32,
    pub split_index: u8,
    pub split_cumulative_sec: f64,
    pub split_segment_sec: Option<f64>,
    pub ts_ns: i64,
}

#[derive(Debug, Clone)]
pub struct LapEvent {
    pub driver: String,
    pub session_id: u32,
    pub lap_number: u32,
    pub lap_time_sec: f64,
    pub splits_sec: [Option<f64>; 3],
    pub completed_at_sec: f64,
}

pub enum HudEvent {
    Split(SplitEvent),
    Lap(LapEvent),
}

struct Inner {
    latest: Option<LatestRow>,
    seq: u64,
    history: VecDeque<TrailPoint>,
    history_cap: usize,
    timings: HashMap<String, LapTiming>,
    drivers: Vec<String>,
    active_driver: String,
    last_seg_idx: usize,
    records: RecordsStore,
    last_timing_snapshot: Option<LapSnapshot>,
}

pub struct HudState {
    track: TrackGeometry,
    topic: String,
    inner: Mutex<Inner>,
}

impl HudState {
    pub fn new(track: TrackGeometry, topic: String, drivers: Vec<String>, mut records: RecordsStore) -> Self {
        let active_driver = drivers.first().cloned().unwrap_or_else(|| "driver1".to_string());
        let mut timings = HashMap::new();
        for name in &drivers {
            let mut timing = LapTiming::new(track.total_len_m);
            let bench = records.benchmarks(name);
            timing.apply_benchmarks(bench.best_lap_sec, bench.best_splits_sec, bench.best_split_segments_sec);
            let recent = records.recent(name);
            timing.apply_recent(recent.last_lap_sec, recent.last_splits_sec, recent.lap_count);
            timings.insert(name.clone(), timing);
        }

        Self {
            track,
            topic,
            inner: Mutex::new(Inner {
                latest: None,
                seq: 0,
                history: VecDeque::new(),
                history_cap: 500,
                timings,
                drivers,
                active_driver,
                last_seg_idx: 0,
                records,
                last_timing_snapshot: None,
            }),
        }
    }

    /// Projects `fix` onto the track, advances the active driver's lap
    /// timing, and returns events for the caller to publish once the lock is
    /// released. Fixes with large track-projection error are dropped.
    pub fn update(&self, fix: &GpsFix) -> Vec<HudEvent> {
        let (s_m, seg_idx, err_m) = {
            let inner = self.inner.lock().unwrap();
            self.track.project(fix.lat, fix.lon, inner.last_seg_idx)
        };
        if err_m > MAX_TRACK_ERROR_M {
            return Vec::new();
        }

        let ts_sec = fix
            .ts_ns
            .filter(|&v| v > 0)
            .map(|v| v as f64 / 1_000_000_000.0)
            .unwrap_or_else(unix_time_now);
        let ts_ns = (ts_sec * 1_000_000_000.0) as i64;

        let mut events = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        inner.last_seg_idx = seg_idx;
        let driver = inner.active_driver.clone();
        let session_id = inner.records.current_session_id(&driver);

        let prev_splits = inner
            .timings
            .get(&driver)
            .map(|t| t.snapshot(ts_sec).current_splits_sec)
            .unwrap_or([None; 3]);

        let (snapshot, completed_lap) = {
            let timing = inner.timings.get_mut(&driver).expect("active driver must have timing state");
            timing.update(ts_sec, s_m)
        };

        // When the lap rolls over, `current_splits_sec` has already been reset
        // to capture the next lap, so the third split (coincident with lap
        // completion) has to be read off the completed lap's own splits.
        let effective_splits = completed_lap.as_ref().map(|lap| lap.splits_sec).unwrap_or(snapshot.current_splits_sec);

        for idx in 0..3usize {
            if prev_splits[idx].is_none() {
                if let Some(new_v) = effective_splits[idx] {
                    let seg_time = match idx {
                        0 => Some(new_v),
                        1 => prev_splits[0].or(effective_splits[0]).map(|s0| new_v - s0),
                        _ => prev_splits[1].or(effective_splits[1]).map(|s1| new_v - s1),
                    };
                    let lap_number = match (&completed_lap, idx) {
                        (Some(lap), 2) => lap.lap_number,
                        _ => snapshot.lap_count + 1,
                    };
                    events.push(HudEvent::Split(SplitEvent {
                        driver: driver.clone(),
                        session_id,
                        lap_number,
                        split_index: idx as u8 + 1,
                        split_cumulative_sec: new_v,
                        split_segment_sec: seg_time,
                        ts_ns,
                    }));
                }
            }
        }

        if let Some(lap) = completed_lap {
            let _ = inner.records.add_lap(
                &driver,
                LapRow {
                    lap_number: lap.lap_number,
                    lap_time_sec: lap.lap_time_sec,
                    splits_sec: lap.splits_sec,
                    completed_at_sec: lap.completed_at_sec,
                },
            );
            events.push(HudEvent::Lap(LapEvent {
                driver: driver.clone(),
                session_id,
                lap_number: lap.lap_number,
                lap_time_sec: lap.lap_time_sec,
                splits_sec: lap.splits_sec,
                completed_at_sec: lap.completed_at_sec,
            }));
        }

        let lap_progress_m = snapshot.lap_progress_m;
        inner.latest = Some(LatestRow {
            lat: fix.lat,
            lon: fix.lon,
            driver: driver.clone(),
            track_s_m: s_m,
            track_error_m: err_m,
            lap_distance_m: lap_progress_m,
            ts_ns,
        });
        inner.seq += 1;
        if inner.history.len() >= inner.history_cap {
            inner.history.pop_front();
        }
        inner.history.push_back(TrailPoint { lat: fix.lat, lon: fix.lon });
        inner.last_timing_snapshot = Some(snapshot);

        events
    }

    pub fn set_active_driver(&self, driver: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.drivers.iter().any(|d| d == driver) {
            return false;
        }
        inner.active_driver = driver.to_string();
        true
    }

    pub fn reset_session(&self) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let driver = inner.active_driver.clone();
        inner.records.reset_session(&driver).unwrap_or_else(|_| inner.records.current_session_id(&driver))
    }

    pub fn snapshot(&self) -> (String, u64, Option<LatestRow>, Vec<TrailPoint>, LapSnapshot, String, Vec<String>) {
        let mut inner = self.inner.lock().unwrap();
        let active_driver = inner.active_driver.clone();
        let timing = inner
            .last_timing_snapshot
            .clone()
            .unwrap_or_else(|| inner.timings[&active_driver].snapshot(unix_time_now()));
        (
            self.topic.clone(),
            inner.seq,
            inner.latest.clone(),
            inner.history.iter().cloned().collect(),
            timing,
            active_driver,
            inner.drivers.clone(),
        )
    }

    pub fn track_points(&self) -> Vec<LatLon> {
        self.track.points().to_vec()
    }

    /// Returns a driver's stored sessions, or `None` if the driver is unknown.
    pub fn driver_sessions(&self, driver: &str) -> Option<HashMap<String, crate::records_store::Session>> {
        let inner = self.inner.lock().unwrap();
        inner.records.driver_sessions(driver).cloned()
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

    fn track() -> TrackGeometry {
        TrackGeometry::new(vec![
            LatLon { lat: 0.0, lon: 0.0 },
            LatLon { lat: 0.001, lon: 0.0 },
            LatLon { lat: 0.001, lon: 0.001 },
            LatLon { lat: 0.0, lon: 0.001 },
        ])
        .unwrap()
    }

    fn hud() -> HudState {
        let drivers = vec!["Alice".to_string(), "Bob".to_string()];
        let path = std::env::temp_dir().join(format!("hud_state_test_{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let records = RecordsStore::load(path, &drivers);
        HudState::new(track(), "subaru/gps".to_string(), drivers, records)
    }

    #[test]
    fn test_update_accepts_on_track_fix_and_advances_seq() {
        let hud = hud();
        hud.update(&GpsFix { lat: 0.0, lon: 0.0, ts_ns: None, fixq: None, sats: None, hdop: None, alt_m: None, speed_mps: None, track_deg: None });
        let (_, seq, latest, _, _, _, _) = hud.snapshot();
        assert_eq!(seq, 1);
        assert!(latest.is_some());
    }

    #[test]
    fn test_update_rejects_fix_far_off_track() {
        let hud = hud();
        hud.update(&GpsFix { lat: 50.0, lon: 50.0, ts_ns: None, fixq: None, sats: None, hdop: None, alt_m: None, speed_mps: None, track_deg: None });
        let (_, seq, latest, _, _, _, _) = hud.snapshot();
        assert_eq!(seq, 0);
        assert!(latest.is_none());
    }

    #[test]
    fn test_set_active_driver_rejects_unknown_name() {
        let hud = hud();
        assert!(!hud.set_active_driver("Nobody"));
        assert!(hud.set_active_driver("Bob"));
        let (_, _, _, _, _, active, _) = hud.snapshot();
        assert_eq!(active, "Bob");
    }
}

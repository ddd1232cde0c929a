//! Armed/running lap timing state machine driven by arclength updates from
//! `TrackGeometry::project`.

pub const MIN_VALID_LAP_SEC: f64 = 20.0;

#[derive(Debug, Clone, PartialEq)]
pub struct LapSnapshot {
    pub lap_count: u32,
    pub current_lap_sec: Option<f64>,
    pub last_lap_sec: Option<f64>,
    pub best_lap_sec: Option<f64>,
    pub current_splits_sec: [Option<f64>; 3],
    pub last_splits_sec: [Option<f64>; 3],
    pub best_splits_sec: [Option<f64>; 3],
    pub best_split_segments_sec: [Option<f64>; 3],
    pub current_split_idx: u8,
    pub split_delta_sec: Option<f64>,
    pub lap_progress_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedLap {
    pub lap_number: u32,
    pub lap_time_sec: f64,
    pub splits_sec: [Option<f64>; 3],
    pub completed_at_sec: f64,
}

pub struct LapTiming {
    lap_len_m: f64,
    split_dist: [f64; 3],
    lap_count: u32,
    armed: bool,
    lap_start_ts: f64,
    lap_progress_m: f64,
    current_splits: [Option<f64>; 3],
    last_splits: [Option<f64>; 3],
    best_splits: [Option<f64>; 3],
    best_split_segments: [Option<f64>; 3],
    last_lap: Option<f64>,
    best_lap: Option<f64>,
    prev_s: Option<f64>,
}

impl LapTiming {
    pub fn new(lap_len_m: f64) -> Self {
        Self {
            lap_len_m,
            split_dist: [lap_len_m / 3.0, (2.0 * lap_len_m) / 3.0, lap_len_m],
            lap_count: 0,
            armed: false,
            lap_start_ts: 0.0,
            lap_progress_m: 0.0,
            current_splits: [None; 3],
            last_splits: [None; 3],
            best_splits: [None; 3],
            best_split_segments: [None; 3],
            last_lap: None,
            best_lap: None,
            prev_s: None,
        }
    }

    /// Seeds `best_lap`/`best_splits`/`best_split_segments` from persisted
    /// benchmarks (RecordsStore). Values below `MIN_VALID_LAP_SEC` are
    /// rejected as corrupt data rather than trusted as benchmarks.
    pub fn apply_benchmarks(&mut self, best_lap: Option<f64>, best_splits: [Option<f64>; 3], best_segments: [Option<f64>; 3]) {
        self.best_lap = best_lap.filter(|&v| v >= MIN_VALID_LAP_SEC);
        self.best_splits = best_splits;
        self.best_split_segments = best_segments;
    }

    /// Seeds `last_lap`/`last_splits`/`lap_count` from the most recently
    /// persisted lap so the UI doesn't regress across a restart.
    pub fn apply_recent(&mut self, last_lap: Option<f64>, last_splits: [Option<f64>; 3], lap_count: u32) {
        self.last_lap = last_lap.filter(|&v| v > 0.0);
        self.last_splits = last_splits.map(|v| v.filter(|&x| x > 0.0));
        self.lap_count = lap_count;
    }

    pub fn update(&mut self, ts_sec: f64, s_m: f64) -> (LapSnapshot, Option<CompletedLap>) {
        let Some(prev_s) = self.prev_s else {
            self.prev_s = Some(s_m);
            return (self.snapshot(ts_sec), None);
        };

        let mut ds = s_m - prev_s;
        if ds < -(self.lap_len_m * 0.5) {
            ds += self.lap_len_m;
        } else if ds > self.lap_len_m * 0.5 {
            ds -= self.lap_len_m;
        }
        self.prev_s = Some(s_m);

        if !self.armed {
            if ds > 0.0 && s_m < self.lap_len_m * 0.12 {
                self.armed = true;
                self.lap_start_ts = ts_sec;
                self.lap_progress_m = 0.0;
                self.current_splits = [None; 3];
            }
            return (self.snapshot(ts_sec), None);
        }

        self.lap_progress_m += ds.max(0.0);
        let elapsed = ts_sec - self.lap_start_ts;

        for i in 0..3 {
            if self.current_splits[i].is_none() && self.lap_progress_m >= self.split_dist[i] {
                self.current_splits[i] = Some(elapsed);
            }
        }

        let mut completed_lap = None;
        if self.lap_progress_m >= self.lap_len_m {
            let lap_time = elapsed;
            self.last_lap = Some(lap_time);
            let is_valid_lap = lap_time >= MIN_VALID_LAP_SEC;
            if is_valid_lap && self.best_lap.map(|b| lap_time < b).unwrap_or(true) {
                self.best_lap = Some(lap_time);
            }
            self.lap_count += 1;
            self.last_splits = self.current_splits;

            if is_valid_lap {
                let segments = split_segments(self.last_splits);
                for i in 0..3 {
                    if let Some(split_time) = self.last_splits[i] {
                        if self.best_splits[i].map(|b| split_time < b).unwrap_or(true) {
                            self.best_splits[i] = Some(split_time);
                        }
                    }
                    if let Some(segment_time) = segments[i] {
                        if self.best_split_segments[i].map(|b| segment_time < b).unwrap_or(true) {
                            self.best_split_segments[i] = Some(segment_time);
                        }
                    }
                }
            }

            completed_lap = Some(CompletedLap {
                lap_number: self.lap_count,
                lap_time_sec: lap_time,
                splits_sec: self.last_splits,
                completed_at_sec: ts_sec,
            });

            self.lap_start_ts = ts_sec;
            self.lap_progress_m = (self.lap_progress_m - self.lap_len_m).max(0.0);
            self.current_splits = [None; 3];
        }

        (self.snapshot(ts_sec), completed_lap)
    }

    pub fn snapshot(&self, ts_sec: f64) -> LapSnapshot {
        let current_lap = if self.armed && self.lap_start_ts > 0.0 {
            Some((ts_sec - self.lap_start_ts).max(0.0))
        } else {
            None
        };

        let current_split_idx: u8 = if self.armed {
            if self.lap_progress_m < self.split_dist[0] {
                1
            } else if self.lap_progress_m < self.split_dist[1] {
                2
            } else {
                3
            }
        } else {
            0
        };

        let delta_sec = if self.armed && current_lap.is_some() && current_split_idx > 0 {
            let current_lap = current_lap.unwrap();
            let current_segment = match current_split_idx {
                1 => Some(current_lap),
                2 => self.current_splits[0].map(|split1| current_lap - split1),
                _ => self.current_splits[1].map(|split2| current_lap - split2),
            };
            let best_segment = self.best_split_segments[current_split_idx as usize - 1];
            match (current_segment, best_segment) {
                (Some(c), Some(b)) => Some(c - b),
                _ => None,
            }
        } else {
            None
        };

        LapSnapshot {
            lap_count: self.lap_count,
            current_lap_sec: current_lap,
            last_lap_sec: self.last_lap,
            best_lap_sec: self.best_lap,
            current_splits_sec: self.current_splits,
            last_splits_sec: self.last_splits,
            best_splits_sec: self.best_splits,
            best_split_segments_sec: self.best_split_segments,
            current_split_idx,
            split_delta_sec: delta_sec,
            lap_progress_m: if self.armed { Some(self.lap_progress_m) } else { None },
        }
    }
}

pub fn split_segments(cumulative: [Option<f64>; 3]) -> [Option<f64>; 3] {
    let [s1, s2, s3] = cumulative;
    let seg1 = s1;
    let seg2 = match (s1, s2) {
        (Some(a), Some(b)) => Some(b - a),
        _ => None,
    };
    let seg3 = match (s2, s3) {
        (Some(a), Some(b)) => Some(b - a),
        _ => None,
    };
    [seg1, seg2, seg3]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_update_only_seeds_prev_s_and_stays_unarmed() {
        let mut timing = LapTiming::new(300.0);
        let (snap, completed) = timing.update(0.0, 150.0);
        assert_eq!(snap.current_split_idx, 0);
        assert!(completed.is_none());
    }

    #[test]
    fn test_arms_just_after_start_finish_crossing() {
        let mut timing = LapTiming::new(300.0);
        timing.update(0.0, 295.0);
        let (snap, _) = timing.update(1.0, 5.0); // ds wraps to +10, s < 0.12*300=36
        assert!(snap.lap_progress_m.is_some());
    }

    #[test]
    fn test_full_lap_completes_and_captures_all_three_splits() {
        let mut timing = LapTiming::new(300.0);
        timing.update(0.0, 0.0); // seed
        timing.update(0.0, 1.0); // arm (ds=1 > 0, s < 36)
        let (_, completed) = timing.update(100.0, 0.999); // ds wraps negative -> progress stays near same; use monotonic instead
        let _ = completed;

        // drive progress explicitly across S1, S2, S3 in one monotonic march
        let mut t = LapTiming::new(300.0);
        t.update(0.0, 0.0);
        t.update(0.0, 1.0); // arms
        let (_, c1) = t.update(40.0, 100.0); // crosses split 1 (100)
        assert!(c1.is_none());
        let (_, c2) = t.update(80.0, 200.0); // crosses split 2 (200)
        assert!(c2.is_none());
        let (snap, completed) = t.update(120.0, 300.0); // crosses split 3 and completes the lap in the same update
        let lap = completed.expect("lap should complete exactly at lap_len_m");
        assert_eq!(lap.lap_number, 1);
        assert!(lap.splits_sec[2].is_some(), "S3 must be captured before rollover, not lost");
        assert_eq!(snap.lap_count, 1);
    }

    #[test]
    fn test_short_lap_does_not_update_best_lap() {
        let mut t = LapTiming::new(300.0);
        t.update(0.0, 0.0);
        t.update(0.0, 1.0); // arms
        let (_, completed) = t.update(5.0, 301.0); // 5s lap, below MIN_VALID_LAP_SEC
        assert!(completed.is_some());
        let snap = t.snapshot(5.0);
        assert!(snap.best_lap_sec.is_none());
    }

    #[test]
    fn test_delta_wrap_handles_start_finish_crossing() {
        let mut t = LapTiming::new(300.0);
        t.update(0.0, 299.0);
        let (snap, _) = t.update(1.0, 2.0); // ds should wrap to +3, not -297
        assert!(snap.lap_progress_m.is_some());
        let progress = snap.lap_progress_m.unwrap();
        assert!(progress < 10.0, "progress {progress} should reflect a small positive ds, not a huge negative jump");
    }
}

//! Closed-polyline track geometry: local planar projection, arclength
//! parametrization, and hint-windowed nearest-point projection.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("track needs at least 4 points, got {0}")]
    TooFewPoints(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

pub struct TrackGeometry {
    points: Vec<LatLon>,
    xy: Vec<(f64, f64)>,
    cum_len: Vec<f64>,
    seg_len: Vec<f64>,
    pub total_len_m: f64,
    m_per_deg_lat: f64,
    m_per_deg_lon: f64,
}

impl TrackGeometry {
    pub fn new(mut points: Vec<LatLon>) -> Result<Self, TrackError> {
        if points.len() < 4 {
            return Err(TrackError::TooFewPoints(points.len()));
        }
        if points.first() != points.last() {
            points.push(points[0]);
        }

        let lat0 = points.iter().map(|p| p.lat).sum::<f64>() / points.len() as f64;
        let m_per_deg_lat = 111132.92;
        let m_per_deg_lon = 111412.84 * lat0.to_radians().cos();

        let to_xy = |p: LatLon| (p.lon * m_per_deg_lon, p.lat * m_per_deg_lat);
        let xy: Vec<(f64, f64)> = points.iter().map(|&p| to_xy(p)).collect();

        let mut cum_len = vec![0.0];
        let mut seg_len = Vec::with_capacity(points.len() - 1);
        let mut total = 0.0;
        for i in 0..points.len() - 1 {
            let (x1, y1) = xy[i];
            let (x2, y2) = xy[i + 1];
            let d = ((x2 - x1).powi(2) + (y2 - y1).powi(2)).sqrt();
            seg_len.push(d);
            total += d;
            cum_len.push(total);
        }

        Ok(Self {
            points,
            xy,
            cum_len,
            seg_len,
            total_len_m: total,
            m_per_deg_lat,
            m_per_deg_lon,
        })
    }

    fn to_xy(&self, p: LatLon) -> (f64, f64) {
        (p.lon * self.m_per_deg_lon, p.lat * self.m_per_deg_lat)
    }

    pub fn point_at_s(&self, s: f64) -> LatLon {
        let d = s.rem_euclid(self.total_len_m);
        for i in 0..self.seg_len.len() {
            let start = self.cum_len[i];
            let end = self.cum_len[i + 1];
            if d <= end {
                let t = if self.seg_len[i] == 0.0 { 0.0 } else { (d - start) / self.seg_len[i] };
                let p1 = self.points[i];
                let p2 = self.points[i + 1];
                return LatLon {
                    lat: p1.lat + (p2.lat - p1.lat) * t,
                    lon: p1.lon + (p2.lon - p1.lon) * t,
                };
            }
        }
        *self.points.last().unwrap()
    }

    /// Returns `(s, segment_idx, err_m)` for the nearest point on the
    /// polyline to `(lat, lon)`, searching only segments within ±8 of
    /// `hint_seg_idx`.
    pub fn project(&self, lat: f64, lon: f64, hint_seg_idx: usize) -> (f64, usize, f64) {
        let (px, py) = self.to_xy(LatLon { lat, lon });
        let n = self.seg_len.len();
        let mut best: Option<f64> = None;
        let mut best_idx = 0usize;
        let mut best_t = 0.0;

        for k in -8i64..=8 {
            let i = (hint_seg_idx as i64 + k).rem_euclid(n as i64) as usize;
            let (x1, y1) = self.xy[i];
            let (x2, y2) = self.xy[i + 1];
            let (vx, vy) = (x2 - x1, y2 - y1);
            let seg2 = vx * vx + vy * vy;
            let t = if seg2 <= 1e-9 {
                0.0
            } else {
                (((px - x1) * vx + (py - y1) * vy) / seg2).clamp(0.0, 1.0)
            };
            let cx = x1 + t * vx;
            let cy = y1 + t * vy;
            let d2 = (px - cx).powi(2) + (py - cy).powi(2);
            if best.map(|b| d2 < b).unwrap_or(true) {
                best = Some(d2);
                best_idx = i;
                best_t = t;
            }
        }

        let s = self.cum_len[best_idx] + best_t * self.seg_len[best_idx];
        let err_m = best.map(f64::sqrt).unwrap_or(0.0);
        (s, best_idx, err_m)
    }

    pub fn points(&self) -> &[LatLon] {
        &self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_track() -> TrackGeometry {
        // ~100m x 100m square near the equator where projection is easiest to reason about.
        let points = vec![
            LatLon { lat: 0.0, lon: 0.0 },
            LatLon { lat: 0.0009, lon: 0.0 },
            LatLon { lat: 0.0009, lon: 0.0009 },
            LatLon { lat: 0.0, lon: 0.0009 },
        ];
        TrackGeometry::new(points).unwrap()
    }

    #[test]
    fn test_rejects_fewer_than_four_points() {
        let points = vec![LatLon { lat: 0.0, lon: 0.0 }, LatLon { lat: 1.0, lon: 1.0 }];
        assert!(matches!(TrackGeometry::new(points), Err(TrackError::TooFewPoints(2))));
    }

    #[test]
    fn test_point_at_zero_is_first_point() {
        let track = square_track();
        let p = track.point_at_s(0.0);
        assert!((p.lat - 0.0).abs() < 1e-9);
        assert!((p.lon - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_at_s_wraps_past_total_length() {
        let track = square_track();
        let at_zero = track.point_at_s(0.0);
        let wrapped = track.point_at_s(track.total_len_m);
        assert!((at_zero.lat - wrapped.lat).abs() < 1e-6);
        assert!((at_zero.lon - wrapped.lon).abs() < 1e-6);
    }

    #[test]
    fn test_project_near_first_vertex_has_small_error() {
        let track = square_track();
        let (s, idx, err_m) = track.project(0.00001, 0.00001, 0);
        assert!(s >= 0.0);
        assert_eq!(idx, 0);
        assert!(err_m < 5.0);
    }

    #[test]
    fn test_project_uses_hint_window_not_full_scan() {
        let track = square_track();
        // a point near the third vertex but with a hint pointing at segment 0
        // should still find the correct nearby segment since n=4 and the
        // +-8 window wraps around the whole track.
        let (_, idx, err_m) = track.project(0.0009, 0.0009, 0);
        assert_eq!(idx, 1);
        assert!(err_m < 5.0);
    }
}

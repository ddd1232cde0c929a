//! Read-only HTTP surface serving the dashboard's data needs: track
//! metadata, the latest sample/timing snapshot, and persisted lap records.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::hud_state::HudState;

#[derive(Clone)]
pub struct AppState {
    pub hud: Arc<HudState>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/meta", get(meta))
        .route("/latest", get(latest))
        .route("/records", get(records))
        .route("/driver", post(set_driver))
        .route("/reset-session", post(reset_session))
        .layer(cors)
        .with_state(state)
}

fn no_store(value: serde_json::Value) -> Response {
    let mut response = Json(value).into_response();
    response.headers_mut().insert("Cache-Control", HeaderValue::from_static("no-store"));
    response
}

async fn index() -> impl IntoResponse {
    axum::response::Html("<html><body><p>subaru-telemetry dashboard placeholder</p></body></html>")
}

async fn meta(State(state): State<AppState>) -> impl IntoResponse {
    let points = state.hud.track_points();
    let n = points.len().saturating_sub(1).max(1);
    let start = points.first().cloned();
    let third = points.get(n / 3).cloned();
    let two_third = points.get(2 * n / 3).cloned();
    let center = {
        let lat = points.iter().map(|p| p.lat).sum::<f64>() / points.len() as f64;
        let lon = points.iter().map(|p| p.lon).sum::<f64>() / points.len() as f64;
        json!({ "lat": lat, "lon": lon })
    };

    no_store(json!({
        "points": points.iter().map(|p| json!({"lat": p.lat, "lon": p.lon})).collect::<Vec<_>>(),
        "start": start.map(|p| json!({"lat": p.lat, "lon": p.lon})),
        "splits": [
            third.map(|p| json!({"lat": p.lat, "lon": p.lon})),
            two_third.map(|p| json!({"lat": p.lat, "lon": p.lon})),
            start.map(|p| json!({"lat": p.lat, "lon": p.lon})),
        ],
        "center": center,
    }))
}

async fn latest(State(state): State<AppState>) -> impl IntoResponse {
    let (topic, seq, latest, history, timing, driver, drivers) = state.hud.snapshot();
    no_store(json!({
        "topic": topic,
        "seq": seq,
        "latest": latest.map(|row| json!({
            "lat": row.lat,
            "lon": row.lon,
            "driver": row.driver,
            "track_s_m": row.track_s_m,
            "track_error_m": row.track_error_m,
            "lap_distance_m": row.lap_distance_m,
            "ts_ns": row.ts_ns,
        })),
        "history": history.iter().map(|p| json!({"lat": p.lat, "lon": p.lon})).collect::<Vec<_>>(),
        "timing": json!({
            "lap_count": timing.lap_count,
            "current_lap_sec": timing.current_lap_sec,
            "last_lap_sec": timing.last_lap_sec,
            "best_lap_sec": timing.best_lap_sec,
            "current_splits_sec": timing.current_splits_sec,
            "last_splits_sec": timing.last_splits_sec,
            "best_splits_sec": timing.best_splits_sec,
            "best_split_segments_sec": timing.best_split_segments_sec,
            "current_split_idx": timing.current_split_idx,
            "split_delta_sec": timing.split_delta_sec,
            "lap_progress_m": timing.lap_progress_m,
        }),
        "driver": driver,
        "drivers": drivers,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecordsQuery {
    driver: Option<String>,
}

async fn records(State(state): State<AppState>, Query(query): Query<RecordsQuery>) -> impl IntoResponse {
    let (_, _, _, _, _, active_driver, drivers) = state.hud.snapshot();
    let driver = query.driver.unwrap_or(active_driver);
    if !drivers.contains(&driver) {
        return (StatusCode::NOT_FOUND, no_store(json!({ "error": "unknown driver" }))).into_response();
    }
    let sessions = state.hud.driver_sessions(&driver).unwrap_or_default();
    no_store(json!({ "driver": driver, "sessions": sessions })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct SetDriverBody {
    driver: String,
}

async fn set_driver(State(state): State<AppState>, Json(body): Json<SetDriverBody>) -> impl IntoResponse {
    if state.hud.set_active_driver(&body.driver) {
        no_store(json!({ "ok": true, "driver": body.driver })).into_response()
    } else {
        (StatusCode::BAD_REQUEST, no_store(json!({ "error": "unknown driver" }))).into_response()
    }
}

async fn reset_session(State(state): State<AppState>) -> impl IntoResponse {
    let session_id = state.hud.reset_session();
    no_store(json!({ "ok": true, "session_id": session_id }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records_store::RecordsStore;
    use crate::track_geometry::{LatLon, TrackGeometry};

    fn app_state() -> AppState {
        let track = TrackGeometry::new(vec![
            LatLon { lat: 0.0, lon: 0.0 },
            LatLon { lat: 0.001, lon: 0.0 },
            LatLon { lat: 0.001, lon: 0.001 },
            LatLon { lat: 0.0, lon: 0.001 },
        ])
        .unwrap();
        let drivers = vec!["Alice".to_string()];
        let path = std::env::temp_dir().join(format!("http_surface_test_{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let records = RecordsStore::load(path, &drivers);
        AppState { hud: Arc::new(HudState::new(track, "subaru/gps".to_string(), drivers, records)) }
    }

    #[tokio::test]
    async fn test_set_driver_rejects_unknown_driver_with_bad_request() {
        let state = app_state();
        let response = set_driver(State(state), Json(SetDriverBody { driver: "Nobody".to_string() })).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_driver_accepts_known_driver() {
        let state = app_state();
        let response = set_driver(State(state), Json(SetDriverBody { driver: "Alice".to_string() })).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

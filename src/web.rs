//! Request/response API + push channel (§6)
//!
//! An `axum` router exposing station/meter CRUD, load/energy/control
//! status, health endpoints, and a WebSocket push channel that relays
//! State Store events.

use crate::allocator::Allocator;
use crate::capability::CapabilityRegistry;
use crate::config::Config;
use crate::constraints::ConstraintsEvaluator;
use crate::error::DlmError;
use crate::failsafe::FailSafeManager;
use crate::logging::get_logger;
use crate::session::SessionManager;
use crate::shedding::SheddingController;
use crate::state::{Command, StateStore};
use crate::types::{Meter, Station};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone)]
pub struct AppState {
    pub store: StateStore,
    pub capabilities: Arc<CapabilityRegistry>,
    pub constraints: Arc<ConstraintsEvaluator>,
    pub shedding: Arc<SheddingController>,
    pub allocator: Arc<Allocator>,
    pub failsafe: Arc<FailSafeManager>,
    pub sessions: Arc<AsyncMutex<SessionManager>>,
    pub config: Arc<Config>,
}

/// Standard envelope every reply carries (§6): `{ok, data?, error?}`.
#[derive(Serialize)]
struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        axum::http::StatusCode::OK,
        Json(Envelope {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }),
    )
        .into_response()
}

fn err(e: DlmError) -> Response {
    let status = match &e {
        DlmError::Validation { .. } | DlmError::ConstraintViolation { .. } => {
            axum::http::StatusCode::BAD_REQUEST
        }
        DlmError::NotDiscovered { .. } | DlmError::StateConflict { .. } => {
            axum::http::StatusCode::NOT_FOUND
        }
        DlmError::CircuitOpen { .. } | DlmError::Timeout { .. } => {
            axum::http::StatusCode::SERVICE_UNAVAILABLE
        }
        _ => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(Envelope::<()> {
            ok: false,
            data: None,
            error: Some(e.to_string()),
            code: Some(e.code()),
        }),
    )
        .into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stations", get(list_stations).post(register_station))
        .route(
            "/stations/{id}",
            get(get_station).delete(remove_station),
        )
        .route("/stations/{id}/power", post(set_power))
        .route("/stations/{id}/session/start", post(start_session))
        .route("/stations/{id}/session/stop", post(stop_session))
        .route("/meters", get(list_meters).post(register_meter))
        .route("/load/status", get(load_status))
        .route("/load/history", get(load_history))
        .route("/load/rebalance", post(rebalance))
        .route("/shedding/status", get(shedding_status))
        .route("/constraints/status", get(constraints_status))
        .route("/constraints/violations", get(violations))
        .route("/failsafe/status", get(failsafe_status))
        .route("/failsafe/{id}/test", post(failsafe_test))
        .route("/config/schema", get(config_schema))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn health() -> Response {
    ok(json!({ "status": "ok" }))
}

async fn list_stations(State(state): State<AppState>) -> Response {
    let snapshot = state.store.snapshot().await;
    let stations: Vec<Station> = snapshot.stations.into_values().collect();
    ok(stations)
}

async fn register_station(State(state): State<AppState>, Json(station): Json<Station>) -> Response {
    match state.store.apply(Command::RegisterStation(station)).await {
        Ok(_) => ok(json!({ "registered": true })),
        Err(e) => err(e),
    }
}

async fn get_station(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    let snapshot = state.store.snapshot().await;
    match snapshot.stations.get(&id) {
        Some(station) => ok(station.clone()),
        None => err(DlmError::not_discovered(format!("station {id} not found"))),
    }
}

async fn remove_station(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state
        .store
        .apply(Command::RemoveStation { station_id: id })
        .await
    {
        Ok(_) => ok(json!({ "removed": true })),
        Err(e) => err(e),
    }
}

#[derive(serde::Deserialize)]
struct SetPowerRequest {
    power_kw: f64,
}

async fn set_power(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<SetPowerRequest>,
) -> Response {
    let snapshot = state.store.snapshot().await;
    let Some(mut station) = snapshot.stations.get(&id).cloned() else {
        return err(DlmError::not_discovered(format!("station {id} not found")));
    };
    station.requested_power_kw = req.power_kw;
    match state
        .store
        .apply(Command::UpdateStation(Box::new(station)))
        .await
    {
        Ok(_) => ok(json!({ "accepted": true })),
        Err(e) => err(e),
    }
}

#[derive(serde::Deserialize)]
struct StartSessionRequest {
    #[serde(default)]
    user_tag: String,
}

async fn start_session(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(_req): Json<StartSessionRequest>,
) -> Response {
    let snapshot = state.store.snapshot().await;
    let Some(station) = snapshot.stations.get(&id) else {
        return err(DlmError::not_discovered(format!("station {id} not found")));
    };
    let mut sessions = state.sessions.lock().await;
    match sessions.start_session(&id, station.total_delivered_kwh) {
        Ok(()) => ok(json!({ "started": true })),
        Err(e) => err(e),
    }
}

async fn stop_session(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    let snapshot = state.store.snapshot().await;
    let Some(station) = snapshot.stations.get(&id) else {
        return err(DlmError::not_discovered(format!("station {id} not found")));
    };
    let mut sessions = state.sessions.lock().await;
    match sessions.end_session(&id, station.total_delivered_kwh) {
        Ok(()) => ok(json!({ "stopped": true })),
        Err(e) => err(e),
    }
}

async fn list_meters(State(state): State<AppState>) -> Response {
    let snapshot = state.store.snapshot().await;
    let meters: Vec<Meter> = snapshot.meters.into_values().collect();
    ok(meters)
}

async fn register_meter(State(state): State<AppState>, Json(meter): Json<Meter>) -> Response {
    match state
        .store
        .apply(Command::ObserveMeterMeasurement(meter))
        .await
    {
        Ok(_) => ok(json!({ "registered": true })),
        Err(e) => err(e),
    }
}

async fn load_status(State(state): State<AppState>) -> Response {
    let snapshot = state.store.snapshot().await;
    let current: f64 = snapshot
        .stations
        .values()
        .map(|s| s.current_power_kw)
        .sum();
    let available = state.constraints.available_capacity(&snapshot.constraints);
    let max = state.config.grid.max_grid_capacity_kw;
    let utilization = if max > 0.0 { current / max } else { 0.0 };
    ok(json!({
        "max_capacity_kw": max,
        "peak_threshold_kw": state.config.grid.peak_demand_threshold_kw,
        "current_kw": current,
        "available_kw": available,
        "utilization_percent": utilization * 100.0,
        "is_peak": current >= state.config.grid.peak_demand_threshold_kw,
    }))
}

async fn load_history(State(state): State<AppState>) -> Response {
    let ticks = state.store.recent_ticks(100).await;
    ok(ticks)
}

async fn rebalance(State(state): State<AppState>) -> Response {
    let result = state.allocator.tick().await;
    ok(result)
}

async fn shedding_status(State(state): State<AppState>) -> Response {
    let snapshot = state.store.snapshot().await;
    ok(snapshot.shedding)
}

async fn constraints_status(State(state): State<AppState>) -> Response {
    let snapshot = state.store.snapshot().await;
    let available = state.constraints.available_capacity(&snapshot.constraints);
    ok(json!({ "topology": snapshot.constraints, "available_capacity_kw": available }))
}

async fn violations(State(state): State<AppState>) -> Response {
    let violations = state.store.recent_violations(1000).await;
    ok(violations)
}

async fn failsafe_status(State(state): State<AppState>) -> Response {
    let snapshot = state.store.snapshot().await;
    let states: Vec<_> = snapshot.failsafe.into_values().collect();
    ok(states)
}

async fn failsafe_test(State(state): State<AppState>, AxumPath(id): AxumPath<String>) -> Response {
    match state.failsafe.test_failsafe(&id).await {
        Some(action) => ok(json!({ "would_apply": format!("{action:?}") })),
        None => err(DlmError::not_discovered(format!(
            "no fail-safe configuration for {id}"
        ))),
    }
}

async fn config_schema(State(state): State<AppState>) -> Response {
    let schema = schemars::schema_for!(Config);
    let _ = &state;
    ok(schema)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let logger = get_logger("web");
    let snapshot = state.store.snapshot().await;
    let established: Value = json!({
        "type": "connection.established",
        "stations": snapshot.stations.values().collect::<Vec<_>>(),
        "load_kw": snapshot.stations.values().map(|s| s.current_power_kw).sum::<f64>(),
    });
    if socket
        .send(Message::Text(established.to_string().into()))
        .await
        .is_err()
    {
        return;
    }

    use tokio_stream::StreamExt;
    let mut events = Box::pin(state.store.subscribe(""));
    loop {
        tokio::select! {
            maybe_event = events.next() => {
                let Some(event) = maybe_event else { break };
                let payload = match serde_json::to_string(&event) {
                    Ok(p) => p,
                    Err(e) => {
                        logger.warn(&format!("failed to serialize push event: {e}"));
                        continue;
                    }
                };
                if socket.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                if incoming.is_none() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::SiteConstraintsTopology;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let store = StateStore::new(SiteConstraintsTopology::default(), Vec::new());
        let capabilities = Arc::new(CapabilityRegistry::new());
        let constraints = Arc::new(ConstraintsEvaluator::new());
        let shedding = Arc::new(SheddingController::new(0.90, 0.75, 5, 0));
        let config = Arc::new(Config::default());
        let allocator = Arc::new(Allocator::new(
            store.clone(),
            capabilities.clone(),
            constraints.clone(),
            shedding.clone(),
            config.grid.clone(),
            config.allocator.clone(),
        ));
        let failsafe = Arc::new(FailSafeManager::new(
            store.clone(),
            config.failsafe.heartbeat_interval_ms,
            config.failsafe.heartbeat_timeout_ms,
        ));
        AppState {
            store,
            capabilities,
            constraints,
            shedding,
            allocator,
            failsafe,
            sessions: Arc::new(AsyncMutex::new(SessionManager::default())),
            config,
        }
    }

    #[tokio::test]
    async fn test_health_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_get_unknown_station_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/stations/missing")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }
}

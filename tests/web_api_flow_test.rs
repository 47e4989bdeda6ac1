use gridwell_dlm::allocator::Allocator;
use gridwell_dlm::capability::CapabilityRegistry;
use gridwell_dlm::config::Config;
use gridwell_dlm::constraints::ConstraintsEvaluator;
use gridwell_dlm::failsafe::FailSafeManager;
use gridwell_dlm::session::SessionManager;
use gridwell_dlm::shedding::SheddingController;
use gridwell_dlm::state::StateStore;
use gridwell_dlm::types::{SiteConstraintsTopology, Station, StationClass};
use gridwell_dlm::web::{router, AppState};
use http_body_util::BodyExt;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tower::ServiceExt;

fn test_app() -> axum::Router {
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
    router(AppState {
        store,
        capabilities,
        constraints,
        shedding,
        allocator,
        failsafe,
        sessions: Arc::new(AsyncMutex::new(SessionManager::default())),
        config,
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Registering a station over the API, then setting its requested power,
/// shows up in a subsequent read of the same station — the wiring between
/// the router, the State Store, and the JSON envelope all round-trip.
#[tokio::test]
async fn register_set_power_and_read_back() {
    let app = test_app();
    let station = Station::new("cp-1", "Charge Point 1", StationClass::Ac3Phase);

    let register = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/stations")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    serde_json::to_vec(&station).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(register.status(), axum::http::StatusCode::OK);
    let register_body = body_json(register).await;
    assert_eq!(register_body["ok"], serde_json::json!(true));

    let set_power = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/stations/cp-1/power")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    serde_json::json!({ "power_kw": 7.4 }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(set_power.status(), axum::http::StatusCode::OK);

    let get = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .uri("/stations/cp-1")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(get.status(), axum::http::StatusCode::OK);
    let get_body = body_json(get).await;
    assert_eq!(get_body["data"]["requested_power_kw"], serde_json::json!(7.4));
}

/// Registering the same station id twice is rejected as a state conflict
/// and surfaces through the error envelope with its taxonomy code.
#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let app = test_app();
    let station = Station::new("dup", "Dup", StationClass::Ac1Phase);
    let body = serde_json::to_vec(&station).unwrap();

    let first = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/stations")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(first.status(), axum::http::StatusCode::OK);

    let second = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/stations")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(second.status(), axum::http::StatusCode::NOT_FOUND);
    let second_body = body_json(second).await;
    assert_eq!(second_body["ok"], serde_json::json!(false));
    assert_eq!(second_body["code"], serde_json::json!("STATE_CONFLICT"));
}

/// `/load/rebalance` triggers a real allocator tick over the registered
/// fleet and returns the tick result through the envelope.
#[tokio::test]
async fn rebalance_runs_a_real_allocator_tick() {
    let app = test_app();
    let mut station = Station::new("cp-2", "Charge Point 2", StationClass::Ac3Phase);
    station.status = gridwell_dlm::types::StationStatus::Charging;
    station.requested_power_kw = 7.4;

    app.clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/stations")
                .header("content-type", "application/json")
                .body(axum::body::Body::from(
                    serde_json::to_vec(&station).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    let rebalance = app
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/load/rebalance")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rebalance.status(), axum::http::StatusCode::OK);
    let body = body_json(rebalance).await;
    assert!(body["data"]["allocations"].as_array().unwrap().len() == 1);
}

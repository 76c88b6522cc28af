use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use ride_dispatch::api::rest::router;
use ride_dispatch::config::Config;
use ride_dispatch::estimator::StraightLineEstimator;
use ride_dispatch::models::assignment::AssignmentNotice;
use ride_dispatch::state::AppState;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tower::ServiceExt;
use uuid::Uuid;

fn setup() -> (axum::Router, Arc<AppState>) {
    let state = Arc::new(AppState::new(
        &Config::default(),
        Arc::new(StraightLineEstimator::default()),
    ));
    (router(state.clone()), state)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn post_event(
    app: &axum::Router,
    source: &str,
    sequence: u64,
    event: Value,
) -> axum::response::Response {
    app.clone()
        .oneshot(json_request(
            "POST",
            "/events",
            json!({ "source": source, "sequence": sequence, "event": event }),
        ))
        .await
        .unwrap()
}

fn driver_online(driver_id: Uuid) -> Value {
    json!({
        "type": "DriverWentOnline",
        "driver_id": driver_id,
        "location": { "lat": 52.521, "lng": 13.401 },
        "vehicle_class": "Economy",
        "at": Utc::now(),
    })
}

fn request_arrived(request_id: Uuid) -> Value {
    json!({
        "type": "RequestArrived",
        "request_id": request_id,
        "pickup": { "lat": 52.520, "lng": 13.400 },
        "dropoff": { "lat": 52.540, "lng": 13.420 },
        "requested_at": Utc::now(),
    })
}

async fn next_notice(rx: &mut broadcast::Receiver<AssignmentNotice>) -> AssignmentNotice {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("assignment confirmed in time")
        .unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _state) = setup();
    let response = app.oneshot(get_request("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["assignments"], 0);
    assert_eq!(body["shards"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _state) = setup();
    let response = post_event(&app, "fleet", 1, driver_online(Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app.oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("events_total"));
    assert!(body.contains("driver_went_online"));
}

#[tokio::test]
async fn request_is_matched_and_broadcast_once() {
    let (app, state) = setup();
    let mut rx = state.assignment_events_tx.subscribe();
    let driver_id = Uuid::new_v4();
    let request_id = Uuid::new_v4();

    let response = post_event(&app, "rider", 1, request_arrived(request_id)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["outcome"], "applied");

    let response = post_event(&app, "fleet", 1, driver_online(driver_id)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["trigger"], "IdleCapacity");

    let notice = next_notice(&mut rx).await;
    assert_eq!(notice.request_id, request_id);
    assert_eq!(notice.driver_id, driver_id);
    assert!(notice.estimated_pickup_minutes >= 0.0);

    let response = app
        .clone()
        .oneshot(get_request(&format!("/requests/{request_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "Matched");

    let response = app
        .clone()
        .oneshot(get_request(&format!("/drivers/{driver_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "Assigned");
    assert_eq!(body["assignment_count"], 1);

    let response = app.oneshot(get_request("/assignments")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["request_id"], json!(request_id));
}

#[tokio::test]
async fn trip_lifecycle_over_http() {
    let (app, state) = setup();
    let mut rx = state.assignment_events_tx.subscribe();
    let driver_id = Uuid::new_v4();
    let request_id = Uuid::new_v4();

    post_event(&app, "fleet", 1, driver_online(driver_id)).await;
    post_event(&app, "rider", 1, request_arrived(request_id)).await;
    let tick = json!({ "type": "TimerTick", "at": Utc::now() });
    let response = post_event(&app, "clock", 1, tick).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    next_notice(&mut rx).await;

    let pickup = json!({
        "type": "PickupConfirmed",
        "request_id": request_id,
        "at": Utc::now(),
    });
    let response = post_event(&app, "fleet", 2, pickup).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let done = json!({
        "type": "TripCompleted",
        "request_id": request_id,
        "at": Utc::now(),
    });
    let response = post_event(&app, "fleet", 3, done).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(get_request(&format!("/requests/{request_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "Completed");

    let response = app
        .oneshot(get_request(&format!("/drivers/{driver_id}")))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "Available");
}

#[tokio::test]
async fn cancelling_unknown_request_returns_404() {
    let (app, _state) = setup();
    let cancel = json!({
        "type": "RequestCancelled",
        "request_id": Uuid::new_v4(),
        "at": Utc::now(),
    });
    let response = post_event(&app, "rider", 1, cancel).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("request"));
}

#[tokio::test]
async fn unknown_request_query_returns_404() {
    let (app, _state) = setup();
    let response = app
        .oneshot(get_request(&format!("/requests/{}", Uuid::new_v4())))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn illegal_transition_returns_409() {
    let (app, _state) = setup();
    let request_id = Uuid::new_v4();
    post_event(&app, "rider", 1, request_arrived(request_id)).await;

    let done = json!({
        "type": "TripCompleted",
        "request_id": request_id,
        "at": Utc::now(),
    });
    let response = post_event(&app, "fleet", 1, done).await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn replayed_sequence_returns_409_and_is_not_applied() {
    let (app, _state) = setup();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    let response = post_event(&app, "rider", 5, request_arrived(first)).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let response = post_event(&app, "rider", 5, request_arrived(second)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .oneshot(get_request(&format!("/requests/{second}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_coordinates_are_ignored() {
    let (app, _state) = setup();
    let event = json!({
        "type": "DriverWentOnline",
        "driver_id": Uuid::new_v4(),
        "location": { "lat": 123.0, "lng": 13.4 },
        "vehicle_class": "Economy",
        "at": Utc::now(),
    });
    let response = post_event(&app, "fleet", 1, event).await;

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = body_json(response).await;
    assert_eq!(body["outcome"], "ignored");
}

#[tokio::test]
async fn malformed_event_is_rejected() {
    let (app, _state) = setup();
    let response = app
        .oneshot(json_request("POST", "/events", json!({ "source": "x", "event": {} })))
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn driver_reappearing_in_another_shard_is_rehomed() {
    let (app, state) = setup();
    let driver_id = Uuid::new_v4();

    post_event(&app, "fleet", 1, driver_online(driver_id)).await;
    let offline = json!({
        "type": "DriverWentOffline",
        "driver_id": driver_id,
        "at": Utc::now(),
    });
    post_event(&app, "fleet", 2, offline).await;

    let elsewhere = json!({
        "type": "DriverWentOnline",
        "driver_id": driver_id,
        "location": { "lat": 48.137, "lng": 11.575 },
        "vehicle_class": "Comfort",
        "at": Utc::now(),
    });
    let response = post_event(&app, "fleet", 3, elsewhere).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(state.router.shard_count(), 2);

    let response = app
        .oneshot(get_request(&format!("/drivers/{driver_id}")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "Available");
    assert_eq!(body["location"]["lat"], 48.137);
}

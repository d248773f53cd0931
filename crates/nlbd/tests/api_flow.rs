//! End-to-end API tests.
//!
//! Drive the full stack over the HTTP surface: register modules, route,
//! heartbeat, scale and roll out a new version.

use axum::Router as HttpRouter;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use nlb_api::{ApiState, build_router};
use nlb_core::Protocol;
use nlb_core::config::PolicyConfig;
use serde_json::{Value, json};
use tower::ServiceExt;

fn test_app() -> (ApiState, HttpRouter) {
    let state = ApiState::new(nlb_router::Router::new());
    let app = build_router(state.clone());
    (state, app)
}

async fn call(
    app: &HttpRouter,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn module(id: &str, version: &str) -> Value {
    json!({
        "instance_id": id,
        "protocol": "http",
        "address": format!("10.0.0.{}:8080", id.len()),
        "version": version,
    })
}

#[tokio::test]
async fn healthz_and_empty_lists() {
    let (_, app) = test_app();

    let (status, body) = call(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["modules"], 0);

    let (status, body) = call(&app, "GET", "/api/v1/modules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let (status, _) = call(&app, "GET", "/api/v1/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn register_route_heartbeat_unregister() {
    let (state, app) = test_app();

    let (status, body) = call(&app, "POST", "/api/v1/modules", Some(module("web-1", "v1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["registration_id"], "web-1");

    // Re-registering the same instance is idempotent.
    let (status, _) = call(&app, "POST", "/api/v1/modules", Some(module("web-1", "v1"))).await;
    assert_eq!(status, StatusCode::OK);

    let conn = state.router.route_connection(Protocol::Http).unwrap();
    assert_eq!(conn.instance_id(), "web-1");

    let (status, body) = call(&app, "GET", "/api/v1/modules/web-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["current_connections"], 1);
    drop(conn);

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/modules/web-1/heartbeat",
        Some(json!({
            "health_status": "degraded",
            "metrics": {"cpu_percent": 91.0, "memory_percent": 40.0, "active_connections": 3}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["acknowledged"], true);
    assert_eq!(body["data"]["health_status"], "degraded");

    let (status, _) = call(&app, "DELETE", "/api/v1/modules/web-1", None).await;
    assert_eq!(status, StatusCode::OK);

    // Evicted or unknown instances are told to register again.
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/modules/web-1/heartbeat",
        Some(json!({"health_status": "healthy"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["acknowledged"], false);
    assert_eq!(body["data"]["instructions"][0]["type"], "reregister");
}

#[tokio::test]
async fn unknown_protocol_is_rejected() {
    let (_, app) = test_app();
    let (status, body) = call(&app, "GET", "/api/v1/modules?protocol=gopher", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn manual_scaling_through_api() {
    let (state, app) = test_app();
    call(&app, "POST", "/api/v1/modules", Some(module("web-1", "v1"))).await;

    let (status, _) = call(
        &app,
        "PUT",
        "/api/v1/scaling/http",
        Some(json!({"min_instances": 1, "max_instances": 4, "cooldown": "1m"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Outside policy bounds.
    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/scaling/http/trigger",
        Some(json!({"target": 9})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Keep the directive timestamp strictly after the registration heartbeat.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/scaling/http/trigger",
        Some(json!({"target": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["direction"], "up");
    assert_eq!(body["data"]["from_instances"], 1);

    // Cooling down now.
    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/scaling/http/trigger",
        Some(json!({"target": 2})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // The next heartbeat carries the directive.
    let (_, body) = call(
        &app,
        "POST",
        "/api/v1/modules/web-1/heartbeat",
        Some(json!({"health_status": "healthy"})),
    )
    .await;
    assert_eq!(body["data"]["instructions"][0]["type"], "scale_hint");
    assert_eq!(body["data"]["instructions"][0]["directive"]["to_instances"], 3);

    let (_, body) = call(&app, "GET", "/api/v1/scaling/http", None).await;
    assert_eq!(body["data"]["state"], "cooldown");
    assert_eq!(state.metrics.counters(Protocol::Http).scale_ups, 1);

    let (status, _) = call(&app, "DELETE", "/api/v1/scaling/http", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", "/api/v1/scaling/http", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn canary_rollout_and_rollback() {
    let (state, app) = test_app();
    call(&app, "POST", "/api/v1/modules", Some(module("blue-1", "v1"))).await;
    call(&app, "POST", "/api/v1/modules", Some(module("green-1", "v2"))).await;

    let (status, _) = call(
        &app,
        "POST",
        "/api/v1/deployments/http",
        Some(json!({"blue": "v1", "green": "v2"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(
        &app,
        "POST",
        "/api/v1/deployments/http/canary",
        Some(json!({"steps": [10, 50, 100]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["green_weight"], 10);
    assert_eq!(body["data"]["status"], "transitioning");

    // Weights reach the registry.
    let (_, body) = call(&app, "GET", "/api/v1/modules/green-1", None).await;
    assert_eq!(body["data"]["traffic_weight"], 10);

    let (_, body) = call(&app, "POST", "/api/v1/deployments/http/promote", None).await;
    assert_eq!(body["data"]["green_weight"], 50);

    let (status, body) = call(&app, "POST", "/api/v1/deployments/http/rollback", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["blue_weight"], 100);
    assert_eq!(body["data"]["status"], "rolled_back");

    let (_, body) = call(&app, "GET", "/api/v1/deployments/http/history", None).await;
    let actions: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions.first(), Some(&"initialized"));
    assert_eq!(actions.last(), Some(&"rollback"));

    let c = state.metrics.counters(Protocol::Http);
    assert_eq!((c.deployment_transitions, c.rollbacks), (3, 1));
}

#[tokio::test]
async fn explicit_weights_must_sum_to_100() {
    let (_, app) = test_app();
    call(
        &app,
        "POST",
        "/api/v1/deployments/redis",
        Some(json!({"blue": "6.2", "green": "7.0"})),
    )
    .await;

    let (status, _) = call(
        &app,
        "PUT",
        "/api/v1/deployments/redis/weights",
        Some(json!({"blue": 70, "green": 20})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &app,
        "PUT",
        "/api/v1/deployments/redis/weights",
        Some(json!({"blue": 0, "green": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stable_color"], "green");
}

#[tokio::test]
async fn rate_limits_through_api() {
    let (state, app) = test_app();

    let (status, body) = call(
        &app,
        "PUT",
        "/api/v1/ratelimits/redis",
        Some(json!({"capacity": 2.0, "refill_rate": 0.0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["capacity"], 2.0);

    assert!(state.limiter.allow("redis"));
    assert!(state.limiter.allow("redis"));
    assert!(!state.limiter.allow("redis"));

    let (_, body) = call(&app, "GET", "/api/v1/ratelimits/redis", None).await;
    assert_eq!(body["data"]["denied"], 1);

    let (status, _) = call(&app, "DELETE", "/api/v1/ratelimits/redis", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "GET", "/api/v1/ratelimits/redis", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_and_prometheus() {
    let (state, app) = test_app();
    call(&app, "POST", "/api/v1/modules", Some(module("web-1", "v1"))).await;
    state
        .autoscaler
        .set_policy(PolicyConfig {
            protocol: Protocol::Http,
            ..Default::default()
        })
        .unwrap();
    state.metrics.record_routed(Protocol::Http);

    let (status, body) = call(&app, "GET", "/api/v1/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["scaling"].as_array().unwrap().len(), 1);

    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("nlb_connections_routed_total{protocol=\"http\"} 1"));
    assert!(text.contains("nlb_modules{protocol=\"http\",state=\"healthy\"} 1"));
}

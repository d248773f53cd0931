//! Registration/heartbeat handlers and read-only views.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use nlb_autoscale::{PolicyStats, ScaleDirective};
use nlb_core::{HealthStatus, MetricsSnapshot};
use nlb_metrics::{Exposition, MetricsReport};
use nlb_ratelimit::BucketStats;
use nlb_rollout::DeploymentState;
use nlb_router::{ModuleEndpoint, ProtocolStats, RegisterOutcome, Registration, RouterError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::ApiState;
use crate::response::{ApiError, ApiResponse, ApiResult, parse_protocol};

// ── Modules ────────────────────────────────────────────────────

/// POST /api/v1/modules
pub async fn register_module(
    State(state): State<ApiState>,
    Json(reg): Json<Registration>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome: RegisterOutcome = state.router.register_module(reg)?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, ApiResponse::ok(outcome)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListModulesQuery {
    pub protocol: Option<String>,
}

/// GET /api/v1/modules
pub async fn list_modules(
    State(state): State<ApiState>,
    Query(query): Query<ListModulesQuery>,
) -> ApiResult<Vec<ModuleEndpoint>> {
    let protocol = query.protocol.as_deref().map(parse_protocol).transpose()?;
    Ok(ApiResponse::ok(state.router.list_modules(protocol)))
}

/// GET /api/v1/modules/{id}
pub async fn get_module(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<ModuleEndpoint> {
    state
        .router
        .get_module(&id)
        .map(ApiResponse::ok)
        .ok_or_else(|| RouterError::UnknownInstance(id).into())
}

#[derive(Debug, Default, Deserialize)]
pub struct UnregisterQuery {
    #[serde(default)]
    pub graceful: bool,
}

#[derive(Debug, Serialize)]
pub struct UnregisterResponse {
    pub instance_id: String,
    /// `true` once the instance is out of the registry; `false` while it
    /// drains in-flight connections.
    pub removed: bool,
}

/// DELETE /api/v1/modules/{id}
pub async fn unregister_module(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<UnregisterQuery>,
) -> ApiResult<UnregisterResponse> {
    let removed = state.router.unregister_module(&id, query.graceful)?;
    Ok(ApiResponse::ok(UnregisterResponse {
        instance_id: id,
        removed,
    }))
}

// ── Heartbeat ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub health_status: HealthStatus,
    #[serde(default)]
    pub metrics: Option<MetricsSnapshot>,
}

/// Instructions piggy-backed on a heartbeat reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Instruction {
    /// Stop accepting new work; the instance is leaving the pool.
    Drain,
    /// The instance is unknown (never registered or evicted) and must
    /// register again.
    Reregister,
    /// Latest scale directive for the instance's protocol.
    ScaleHint { directive: ScaleDirective },
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub instance_id: String,
    pub acknowledged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_status: Option<HealthStatus>,
    pub instructions: Vec<Instruction>,
}

/// POST /api/v1/modules/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<HeartbeatResponse> {
    let ack = match state.router.heartbeat(&id, req.health_status, req.metrics) {
        Ok(ack) => ack,
        Err(RouterError::UnknownInstance(_)) => {
            info!(instance_id = %id, "heartbeat from unknown instance, asking to re-register");
            return Ok(ApiResponse::ok(HeartbeatResponse {
                instance_id: id,
                acknowledged: false,
                health_status: None,
                instructions: vec![Instruction::Reregister],
            }));
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(metrics) = req.metrics {
        state.autoscaler.record_metrics(ack.protocol, &id, metrics);
    }

    let mut instructions = Vec::new();
    if ack.draining {
        instructions.push(Instruction::Drain);
    } else if let Some(directive) = state.autoscaler.last_directive(ack.protocol)
        && directive.at > ack.previous_heartbeat
    {
        instructions.push(Instruction::ScaleHint { directive });
    }
    debug!(
        instance_id = %id,
        status = %ack.health_status,
        instructions = instructions.len(),
        "heartbeat"
    );

    Ok(ApiResponse::ok(HeartbeatResponse {
        instance_id: id,
        acknowledged: true,
        health_status: Some(ack.health_status),
        instructions,
    }))
}

// ── Views ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub pools: Vec<ProtocolStats>,
    pub counters: MetricsReport,
    pub rate_limits: Vec<BucketStats>,
    pub scaling: Vec<PolicyStats>,
    pub deployments: Vec<DeploymentState>,
}

/// GET /api/v1/stats
pub async fn stats(State(state): State<ApiState>) -> ApiResult<StatsResponse> {
    Ok(ApiResponse::ok(StatsResponse {
        pools: state.router.stats(),
        counters: state.metrics.report(),
        rate_limits: state.limiter.all_stats(),
        scaling: state.autoscaler.all_stats(),
        deployments: state.rollout.all(),
    }))
}

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "modules": state.router.len(),
    }))
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let report = state.metrics.report();
    let pools = state.router.stats();
    let buckets = state.limiter.all_stats();
    let deployments = state.rollout.all();
    let body = nlb_metrics::render_prometheus(&Exposition {
        report: &report,
        pools: &pools,
        buckets: &buckets,
        deployments: &deployments,
    });
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlb_core::Protocol;
    use nlb_core::config::PolicyConfig;
    use std::time::Instant;

    fn test_state() -> ApiState {
        ApiState::new(nlb_router::Router::new())
    }

    fn reg(id: &str) -> Registration {
        Registration::new(id, Protocol::Http, "127.0.0.1:8080").with_version("v1")
    }

    #[tokio::test]
    async fn register_then_reregister() {
        let state = test_state();
        let resp = register_module(State(state.clone()), Json(reg("m1")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = register_module(State(state.clone()), Json(reg("m1")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.router.len(), 1);
    }

    #[tokio::test]
    async fn register_conflicting_protocol() {
        let state = test_state();
        state.router.register_module(reg("m1")).unwrap();
        let other = Registration::new("m1", Protocol::Redis, "127.0.0.1:6379");
        let resp = register_module(State(state), Json(other))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn list_rejects_unknown_protocol() {
        let state = test_state();
        let query = ListModulesQuery {
            protocol: Some("gopher".into()),
        };
        let err = list_modules(State(state), Query(query)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_missing_module() {
        let err = get_module(State(test_state()), Path("nope".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn heartbeat_unknown_asks_for_reregistration() {
        let Json(body) = heartbeat(
            State(test_state()),
            Path("ghost".into()),
            Json(HeartbeatRequest {
                health_status: HealthStatus::Healthy,
                metrics: None,
            }),
        )
        .await
        .unwrap();
        let data = body.data.unwrap();
        assert!(!data.acknowledged);
        assert_eq!(data.instructions, vec![Instruction::Reregister]);
    }

    #[tokio::test]
    async fn heartbeat_on_draining_instance_says_drain() {
        let state = test_state();
        state.router.register_module(reg("m1")).unwrap();
        let _conn = state.router.route_connection(Protocol::Http).unwrap();
        state.router.unregister_module("m1", true).unwrap();

        let Json(body) = heartbeat(
            State(state),
            Path("m1".into()),
            Json(HeartbeatRequest {
                health_status: HealthStatus::Healthy,
                metrics: None,
            }),
        )
        .await
        .unwrap();
        let data = body.data.unwrap();
        assert_eq!(data.health_status, Some(HealthStatus::Stopping));
        assert_eq!(data.instructions, vec![Instruction::Drain]);
    }

    #[tokio::test]
    async fn heartbeat_carries_fresh_scale_hint_once() {
        let state = test_state();
        state.router.register_module(reg("m1")).unwrap();
        state
            .autoscaler
            .set_policy(PolicyConfig {
                protocol: Protocol::Http,
                max_instances: 5,
                ..Default::default()
            })
            .unwrap();
        // Make sure the directive timestamp lands after registration.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        state
            .autoscaler
            .trigger_scaling_at(Protocol::Http, 3, 1, Instant::now())
            .unwrap();

        let beat = || {
            heartbeat(
                State(state.clone()),
                Path("m1".into()),
                Json(HeartbeatRequest {
                    health_status: HealthStatus::Healthy,
                    metrics: Some(MetricsSnapshot {
                        cpu_percent: 40.0,
                        ..Default::default()
                    }),
                }),
            )
        };
        let Json(first) = beat().await.unwrap();
        let instructions = first.data.unwrap().instructions;
        assert!(matches!(
            instructions.as_slice(),
            [Instruction::ScaleHint { directive }] if directive.to_instances == 3
        ));

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let Json(second) = beat().await.unwrap();
        assert!(second.data.unwrap().instructions.is_empty());
    }

    #[tokio::test]
    async fn unregister_graceful_with_open_connection_drains() {
        let state = test_state();
        state.router.register_module(reg("m1")).unwrap();
        let conn = state.router.route_connection(Protocol::Http).unwrap();

        let Json(body) = unregister_module(
            State(state.clone()),
            Path("m1".into()),
            Query(UnregisterQuery { graceful: true }),
        )
        .await
        .unwrap();
        assert!(!body.data.unwrap().removed);
        assert!(state.router.get_module("m1").is_some());

        conn.release();
        assert!(state.router.get_module("m1").is_none());
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let resp = prometheus_metrics(State(test_state())).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }
}

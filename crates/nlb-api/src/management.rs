//! Management surface: blue/green deployments, scaling policies and rate
//! limits.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use nlb_autoscale::{PolicyStats, ScaleDirection, ScaleDirective, ScalingEvent};
use nlb_core::config::PolicyConfig;
use nlb_core::{Color, Protocol};
use nlb_ratelimit::BucketStats;
use nlb_rollout::{DeploymentState, RolloutResult, WeightChange};
use serde::Deserialize;
use tracing::info;

use crate::ApiState;
use crate::response::{ApiError, ApiResponse, ApiResult, parse_protocol};

// ── Deployments ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct InitializeRequest {
    pub blue: String,
    pub green: String,
}

#[derive(Debug, Deserialize)]
pub struct WeightRequest {
    pub blue: u8,
    pub green: u8,
}

#[derive(Debug, Deserialize)]
pub struct CanaryRequest {
    pub steps: Vec<u8>,
}

/// Target of an instant switch: a color or a deployed version.
#[derive(Debug, Default, Deserialize)]
pub struct SwitchRequest {
    #[serde(default)]
    pub color: Option<Color>,
    #[serde(default)]
    pub version: Option<String>,
}

/// Count a successful weight transition and wrap the new state.
fn transitioned(
    state: &ApiState,
    protocol: Protocol,
    result: RolloutResult<DeploymentState>,
    rollback: bool,
) -> ApiResult<DeploymentState> {
    let deployment = result?;
    state
        .metrics
        .record_deployment_transition(protocol, rollback);
    Ok(ApiResponse::ok(deployment))
}

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> ApiResult<Vec<DeploymentState>> {
    Ok(ApiResponse::ok(state.rollout.all()))
}

/// GET /api/v1/deployments/{protocol}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<DeploymentState> {
    let protocol = parse_protocol(&protocol)?;
    state
        .rollout
        .get(protocol)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("no deployment for {protocol}")))
}

/// POST /api/v1/deployments/{protocol}
pub async fn initialize_deployment(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
    Json(req): Json<InitializeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let protocol = parse_protocol(&protocol)?;
    let deployment = state
        .rollout
        .initialize_deployment(protocol, &req.blue, &req.green)?;
    Ok((StatusCode::CREATED, ApiResponse::ok(deployment)))
}

/// PUT /api/v1/deployments/{protocol}/weights
pub async fn set_traffic_weight(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
    Json(req): Json<WeightRequest>,
) -> ApiResult<DeploymentState> {
    let protocol = parse_protocol(&protocol)?;
    let result = state
        .rollout
        .set_traffic_weight(protocol, req.blue, req.green);
    transitioned(&state, protocol, result, false)
}

/// POST /api/v1/deployments/{protocol}/canary
pub async fn start_canary(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
    Json(req): Json<CanaryRequest>,
) -> ApiResult<DeploymentState> {
    let protocol = parse_protocol(&protocol)?;
    let result = state.rollout.start_canary(protocol, &req.steps);
    transitioned(&state, protocol, result, false)
}

/// POST /api/v1/deployments/{protocol}/promote
pub async fn promote_version(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<DeploymentState> {
    let protocol = parse_protocol(&protocol)?;
    let result = state.rollout.promote_version(protocol);
    transitioned(&state, protocol, result, false)
}

/// POST /api/v1/deployments/{protocol}/switch
pub async fn instant_switch(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
    Json(req): Json<SwitchRequest>,
) -> ApiResult<DeploymentState> {
    let protocol = parse_protocol(&protocol)?;
    let result = match (req.color, req.version.as_deref()) {
        (Some(color), None) => state.rollout.instant_switch(protocol, color),
        (None, Some(version)) => state.rollout.instant_switch_to_version(protocol, version),
        _ => {
            return Err(ApiError::bad_request(
                "exactly one of `color` or `version` is required",
            ));
        }
    };
    transitioned(&state, protocol, result, false)
}

/// POST /api/v1/deployments/{protocol}/rollback
pub async fn rollback(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<DeploymentState> {
    let protocol = parse_protocol(&protocol)?;
    let result = state.rollout.rollback(protocol);
    transitioned(&state, protocol, result, true)
}

/// GET /api/v1/deployments/{protocol}/history
pub async fn deployment_history(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<Vec<WeightChange>> {
    let protocol = parse_protocol(&protocol)?;
    Ok(ApiResponse::ok(state.rollout.history(protocol)?))
}

// ── Scaling ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub target: u32,
}

/// GET /api/v1/scaling
pub async fn list_scaling_policies(State(state): State<ApiState>) -> ApiResult<Vec<PolicyStats>> {
    Ok(ApiResponse::ok(state.autoscaler.all_stats()))
}

/// GET /api/v1/scaling/{protocol}
pub async fn get_scaling_policy(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<PolicyStats> {
    let protocol = parse_protocol(&protocol)?;
    state
        .autoscaler
        .stats(protocol)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("no scaling policy for {protocol}")))
}

/// PUT /api/v1/scaling/{protocol}
///
/// The protocol in the path wins over one in the body.
pub async fn set_scaling_policy(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
    Json(mut policy): Json<PolicyConfig>,
) -> ApiResult<PolicyStats> {
    let protocol = parse_protocol(&protocol)?;
    policy.protocol = protocol;
    state.autoscaler.set_policy(policy)?;
    state
        .autoscaler
        .stats(protocol)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("no scaling policy for {protocol}")))
}

/// DELETE /api/v1/scaling/{protocol}
pub async fn remove_scaling_policy(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<&'static str> {
    let protocol = parse_protocol(&protocol)?;
    if state.autoscaler.remove_policy(protocol) {
        info!(protocol = %protocol, "scaling policy removed");
        Ok(ApiResponse::ok("deleted"))
    } else {
        Err(ApiError::not_found(format!("no scaling policy for {protocol}")))
    }
}

/// POST /api/v1/scaling/{protocol}/trigger
pub async fn trigger_scaling(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<ScaleDirective> {
    let protocol = parse_protocol(&protocol)?;
    let directive = state.autoscaler.trigger_scaling(protocol, req.target).await?;
    state
        .metrics
        .record_scaling_event(protocol, directive.direction == ScaleDirection::Up);
    Ok(ApiResponse::ok(directive))
}

/// GET /api/v1/scaling/{protocol}/history
pub async fn scaling_history(
    State(state): State<ApiState>,
    Path(protocol): Path<String>,
) -> ApiResult<Vec<ScalingEvent>> {
    let protocol = parse_protocol(&protocol)?;
    Ok(ApiResponse::ok(state.autoscaler.history(Some(protocol))))
}

// ── Rate limits ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RateLimitRequest {
    pub capacity: f64,
    pub refill_rate: f64,
}

/// GET /api/v1/ratelimits
pub async fn list_rate_limits(State(state): State<ApiState>) -> ApiResult<Vec<BucketStats>> {
    Ok(ApiResponse::ok(state.limiter.all_stats()))
}

/// GET /api/v1/ratelimits/{key}
pub async fn get_rate_limit(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<BucketStats> {
    state
        .limiter
        .stats(&key)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("no rate limit for {key}")))
}

/// PUT /api/v1/ratelimits/{key}
///
/// Replaces any existing bucket; the new bucket starts full.
pub async fn set_rate_limit(
    State(state): State<ApiState>,
    Path(key): Path<String>,
    Json(req): Json<RateLimitRequest>,
) -> ApiResult<BucketStats> {
    state
        .limiter
        .add_bucket(&key, req.capacity, req.refill_rate)?;
    state
        .limiter
        .stats(&key)
        .map(ApiResponse::ok)
        .ok_or_else(|| ApiError::not_found(format!("no rate limit for {key}")))
}

/// DELETE /api/v1/ratelimits/{key}
pub async fn remove_rate_limit(
    State(state): State<ApiState>,
    Path(key): Path<String>,
) -> ApiResult<&'static str> {
    if state.limiter.remove_bucket(&key) {
        Ok(ApiResponse::ok("deleted"))
    } else {
        Err(ApiError::not_found(format!("no rate limit for {key}")))
    }
}

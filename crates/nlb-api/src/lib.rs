//! nlb-api — HTTP/JSON surface of the load balancer.
//!
//! Modules register and heartbeat here; operators and orchestrators
//! manage blue/green splits, scaling policies and rate limits. Every
//! response uses the `{success, data, error}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/modules` | Register (idempotent per instance id) |
//! | GET | `/api/v1/modules?protocol=` | List registry snapshot |
//! | GET | `/api/v1/modules/{id}` | Get one instance |
//! | DELETE | `/api/v1/modules/{id}?graceful=` | Unregister or drain |
//! | POST | `/api/v1/modules/{id}/heartbeat` | Heartbeat + instructions |
//! | GET | `/api/v1/deployments` | List blue/green deployments |
//! | POST/GET | `/api/v1/deployments/{protocol}` | Initialize / get |
//! | PUT | `/api/v1/deployments/{protocol}/weights` | Set explicit split |
//! | POST | `/api/v1/deployments/{protocol}/canary` | Start canary steps |
//! | POST | `/api/v1/deployments/{protocol}/promote` | Next canary step |
//! | POST | `/api/v1/deployments/{protocol}/switch` | Instant switch |
//! | POST | `/api/v1/deployments/{protocol}/rollback` | Roll back |
//! | GET | `/api/v1/deployments/{protocol}/history` | Weight history |
//! | GET | `/api/v1/scaling` | All policy stats |
//! | PUT/GET/DELETE | `/api/v1/scaling/{protocol}` | Manage a policy |
//! | POST | `/api/v1/scaling/{protocol}/trigger` | Manual scale |
//! | GET | `/api/v1/scaling/{protocol}/history` | Scaling history |
//! | GET | `/api/v1/ratelimits` | All bucket stats |
//! | PUT/GET/DELETE | `/api/v1/ratelimits/{key}` | Manage a bucket |
//! | GET | `/api/v1/stats` | Combined stats |
//! | GET | `/healthz` | Liveness |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod management;
pub mod response;

use axum::Router;
use axum::routing::{get, post, put};
use nlb_autoscale::Autoscaler;
use nlb_metrics::NlbMetrics;
use nlb_ratelimit::RateLimiter;
use nlb_rollout::BlueGreenController;
use std::sync::Arc;

pub use response::{ApiError, ApiResponse};

/// Shared state for API handlers. Every field is a handle onto state the
/// data path also uses.
#[derive(Clone)]
pub struct ApiState {
    pub router: nlb_router::Router,
    pub limiter: Arc<RateLimiter>,
    pub autoscaler: Arc<Autoscaler>,
    pub rollout: Arc<BlueGreenController>,
    pub metrics: Arc<NlbMetrics>,
}

impl ApiState {
    /// State with default subsystems around `router`.
    pub fn new(router: nlb_router::Router) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::default()),
            autoscaler: Arc::new(Autoscaler::new(router.clone())),
            rollout: Arc::new(BlueGreenController::new(router.clone())),
            metrics: Arc::new(NlbMetrics::new()),
            router,
        }
    }
}

/// Build the complete API router (REST + health + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/modules",
            get(handlers::list_modules).post(handlers::register_module),
        )
        .route(
            "/modules/{id}",
            get(handlers::get_module).delete(handlers::unregister_module),
        )
        .route("/modules/{id}/heartbeat", post(handlers::heartbeat))
        .route("/stats", get(handlers::stats))
        .route("/deployments", get(management::list_deployments))
        .route(
            "/deployments/{protocol}",
            get(management::get_deployment).post(management::initialize_deployment),
        )
        .route(
            "/deployments/{protocol}/weights",
            put(management::set_traffic_weight),
        )
        .route("/deployments/{protocol}/canary", post(management::start_canary))
        .route("/deployments/{protocol}/promote", post(management::promote_version))
        .route("/deployments/{protocol}/switch", post(management::instant_switch))
        .route("/deployments/{protocol}/rollback", post(management::rollback))
        .route(
            "/deployments/{protocol}/history",
            get(management::deployment_history),
        )
        .route("/scaling", get(management::list_scaling_policies))
        .route(
            "/scaling/{protocol}",
            get(management::get_scaling_policy)
                .put(management::set_scaling_policy)
                .delete(management::remove_scaling_policy),
        )
        .route("/scaling/{protocol}/trigger", post(management::trigger_scaling))
        .route("/scaling/{protocol}/history", get(management::scaling_history))
        .route("/ratelimits", get(management::list_rate_limits))
        .route(
            "/ratelimits/{key}",
            get(management::get_rate_limit)
                .put(management::set_rate_limit)
                .delete(management::remove_rate_limit),
        )
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz).with_state(state.clone()))
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}

//! Daemon assembly: builds every subsystem from `NlbConfig`, starts the
//! L4 listener, the management API and the background loops, and tears
//! them down together on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use nlb_api::ApiState;
use nlb_autoscale::{Autoscaler, ScaleDirection, TriggerSource};
use nlb_core::{NlbConfig, parse_duration};
use nlb_metrics::NlbMetrics;
use nlb_ratelimit::RateLimiter;
use nlb_rollout::BlueGreenController;
use nlb_router::{RegistryEvent, Router};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::proxy::{Proxy, ProxySettings};

/// Wire the shared subsystems together. `config` must already be valid.
pub fn build_state(config: &NlbConfig) -> anyhow::Result<ApiState> {
    let router = Router::with_health_policy(
        parse_duration(&config.health.heartbeat_timeout)?,
        config.health.max_missed_heartbeats,
    );

    let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit)?);
    let metrics = Arc::new(NlbMetrics::new());

    // Manual directives are counted by the API handler that issues them.
    let scale_metrics = Arc::clone(&metrics);
    let autoscaler = Autoscaler::new(router.clone())
        .with_history_limit(config.autoscale.history_limit)
        .with_automatic(config.autoscale.enabled)
        .with_scale_fn(Box::new(move |directive| {
            let metrics = Arc::clone(&scale_metrics);
            Box::pin(async move {
                if directive.source == TriggerSource::Automatic {
                    metrics.record_scaling_event(
                        directive.protocol,
                        directive.direction == ScaleDirection::Up,
                    );
                }
                Ok(())
            })
        }));
    for policy in &config.autoscale.policies {
        autoscaler.set_policy(policy.clone())?;
    }

    let rollout = BlueGreenController::from_config(router.clone(), &config.rollout)?;

    Ok(ApiState {
        router,
        limiter,
        autoscaler: Arc::new(autoscaler),
        rollout: Arc::new(rollout),
        metrics,
    })
}

pub async fn run(config: NlbConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    info!("NLB daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let state = build_state(&config)?;
    info!(
        buckets = state.limiter.len(),
        policies = config.autoscale.policies.len(),
        deployments = config.rollout.deployments.len(),
        "subsystems initialized"
    );

    let settings = ProxySettings {
        max_inspect_bytes: config.inspector.max_inspect_bytes,
        classification_timeout: parse_duration(&config.inspector.classification_timeout)?,
        connect_timeout: parse_duration(&config.server.upstream_connect_timeout)?,
        catch_all: config.inspector.catch_all,
    };
    let autoscale_interval = parse_duration(&config.autoscale.interval)?;
    let sweep_interval = parse_duration(&config.health.sweep_interval)?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let mut handles = Vec::new();

    if config.autoscale.enabled {
        let autoscaler = Arc::clone(&state.autoscaler);
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            autoscaler.run(autoscale_interval, shutdown).await;
        }));
    } else {
        info!("autoscaler disabled");
    }

    let sweeper = state.router.clone();
    let shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        sweeper.run_sweeper(sweep_interval, shutdown).await;
    }));

    let events = state.router.subscribe();
    let shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(log_registry_events(events, shutdown)));

    // ── Start L4 listener ──────────────────────────────────────

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("bind listener on {}", config.server.bind))?;
    let proxy = Arc::new(Proxy::new(state.clone(), settings));
    let shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(proxy.serve(listener, shutdown)));

    // ── Start API server ───────────────────────────────────────

    let api_listener = TcpListener::bind(&config.server.api_bind)
        .await
        .with_context(|| format!("bind API on {}", config.server.api_bind))?;
    info!(addr = %config.server.api_bind, "API server starting");

    let app = nlb_api::build_router(state);
    axum::serve(api_listener, app)
        .with_graceful_shutdown(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }

    info!("NLB daemon stopped");
    Ok(())
}

/// Log registry changes until shutdown. This is the hook an external
/// configuration store would follow.
async fn log_registry_events(
    mut events: broadcast::Receiver<RegistryEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!(event = %json, "registry event"),
                    Err(e) => warn!(error = %e, "unserializable registry event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "registry event log fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

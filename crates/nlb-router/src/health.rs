//! Heartbeat intake and heartbeat-timeout eviction.
//!
//! Silence longer than the heartbeat timeout marks an instance unhealthy
//! (excluded from routing, still registered). Each further timeout period
//! counts as another missed heartbeat; reaching the configured maximum
//! removes the instance. The sweep also reaps draining instances whose
//! last connection has closed.

use crate::error::{RouterError, RouterResult};
use crate::events::{RegistryEventKind, RemovalReason};
use crate::registry::Router;
use nlb_core::{HealthStatus, MetricsSnapshot, Protocol, epoch_millis};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Router-side result of a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeartbeatAck {
    pub instance_id: String,
    pub protocol: Protocol,
    pub health_status: HealthStatus,
    /// Epoch milliseconds of the heartbeat before this one.
    pub previous_heartbeat: u64,
    pub draining: bool,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub marked_unhealthy: Vec<String>,
    pub removed: Vec<String>,
    pub drained: Vec<String>,
}

impl Router {
    pub fn heartbeat_timeout(&self) -> Duration {
        self.inner.heartbeat_timeout
    }

    pub fn max_missed_heartbeats(&self) -> u32 {
        self.inner.max_missed_heartbeats
    }

    pub fn heartbeat(
        &self,
        instance_id: &str,
        status: HealthStatus,
        metrics: Option<MetricsSnapshot>,
    ) -> RouterResult<HeartbeatAck> {
        self.heartbeat_at(instance_id, status, metrics, epoch_millis())
    }

    /// Record a heartbeat. A draining instance stays `Stopping` whatever
    /// it reports.
    pub fn heartbeat_at(
        &self,
        instance_id: &str,
        status: HealthStatus,
        metrics: Option<MetricsSnapshot>,
        now_ms: u64,
    ) -> RouterResult<HeartbeatAck> {
        let entry = self
            .inner
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| RouterError::UnknownInstance(instance_id.to_string()))?;

        let previous_heartbeat = entry.touch(now_ms);
        if let Some(m) = metrics {
            entry.set_metrics(m);
        }

        let draining = entry.is_draining();
        let new_status = if draining {
            HealthStatus::Stopping
        } else {
            status
        };
        let previous = entry.set_health(new_status);
        if previous != new_status {
            if previous == HealthStatus::Unhealthy {
                info!(instance_id, to = %new_status, "module recovered");
            }
            self.inner.emit(RegistryEventKind::HealthChanged {
                instance_id: instance_id.to_string(),
                protocol: entry.protocol,
                from: previous,
                to: new_status,
            });
        }

        Ok(HeartbeatAck {
            instance_id: instance_id.to_string(),
            protocol: entry.protocol,
            health_status: new_status,
            previous_heartbeat,
            draining,
        })
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(epoch_millis())
    }

    /// Apply heartbeat timeouts as of `now_ms` and reap drained instances.
    pub fn sweep_at(&self, now_ms: u64) -> SweepReport {
        let timeout_ms = (self.inner.heartbeat_timeout.as_millis() as u64).max(1);
        let max_missed = self.inner.max_missed_heartbeats;
        let entries: Vec<_> = self
            .inner
            .read()
            .by_protocol
            .values()
            .flatten()
            .cloned()
            .collect();

        let mut report = SweepReport::default();
        for entry in entries {
            let id = entry.instance_id.as_str();
            if entry.is_draining() && entry.connections() == 0 {
                if self
                    .inner
                    .remove(id, Some(&entry), RemovalReason::Drained)
                    .is_some()
                {
                    report.drained.push(id.to_string());
                }
                continue;
            }

            let last = entry.last_heartbeat();
            let missed = (now_ms.saturating_sub(last) / timeout_ms) as u32;
            if missed == 0 {
                continue;
            }
            // A heartbeat that landed after we read `last` wins.
            if entry.last_heartbeat() != last {
                continue;
            }
            entry.set_missed(missed);

            if missed >= max_missed {
                warn!(
                    instance_id = id,
                    protocol = %entry.protocol,
                    missed,
                    "heartbeat timeout, removing module"
                );
                if self
                    .inner
                    .remove(id, Some(&entry), RemovalReason::HeartbeatTimeout)
                    .is_some()
                {
                    report.removed.push(id.to_string());
                }
                continue;
            }

            if !entry.is_draining() {
                let previous = entry.set_health(HealthStatus::Unhealthy);
                if previous != HealthStatus::Unhealthy {
                    warn!(
                        instance_id = id,
                        protocol = %entry.protocol,
                        missed,
                        "heartbeat missed, marking module unhealthy"
                    );
                    self.inner.emit(RegistryEventKind::HealthChanged {
                        instance_id: id.to_string(),
                        protocol: entry.protocol,
                        from: previous,
                        to: HealthStatus::Unhealthy,
                    });
                    report.marked_unhealthy.push(id.to_string());
                }
            }
        }
        report
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run_sweeper(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if !report.removed.is_empty() || !report.drained.is_empty() {
                        info!(
                            removed = report.removed.len(),
                            drained = report.drained.len(),
                            "registry sweep"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("heartbeat sweeper shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Registration;

    fn router() -> Router {
        Router::with_health_policy(Duration::from_secs(10), 3)
    }

    fn register(router: &Router, id: &str, now_ms: u64) {
        router
            .register_module_at(
                Registration::new(id, Protocol::MySql, "10.0.0.1:3306"),
                now_ms,
            )
            .unwrap();
    }

    #[test]
    fn heartbeat_unknown_instance() {
        let router = router();
        assert_eq!(
            router.heartbeat("ghost", HealthStatus::Healthy, None),
            Err(RouterError::UnknownInstance("ghost".into()))
        );
    }

    #[test]
    fn heartbeat_updates_status_and_metrics() {
        let router = router();
        register(&router, "m1", 1_000);
        let metrics = MetricsSnapshot {
            cpu_percent: 55.0,
            ..Default::default()
        };
        let ack = router
            .heartbeat_at("m1", HealthStatus::Degraded, Some(metrics), 2_000)
            .unwrap();
        assert_eq!(ack.previous_heartbeat, 1_000);
        assert_eq!(ack.health_status, HealthStatus::Degraded);

        let m = router.get_module("m1").unwrap();
        assert_eq!(m.last_heartbeat, 2_000);
        assert_eq!(m.last_metrics.unwrap().cpu_percent, 55.0);
    }

    #[test]
    fn missed_heartbeats_mark_unhealthy_then_remove() {
        let router = router();
        register(&router, "m1", 0);

        assert_eq!(router.sweep_at(9_999), SweepReport::default());

        let report = router.sweep_at(10_000);
        assert_eq!(report.marked_unhealthy, vec!["m1"]);
        let m = router.get_module("m1").unwrap();
        assert_eq!(m.health_status, HealthStatus::Unhealthy);
        assert_eq!(m.missed_heartbeats, 1);
        assert!(router.route_connection(Protocol::MySql).is_err());

        // Still unhealthy, not re-reported.
        let report = router.sweep_at(20_000);
        assert!(report.marked_unhealthy.is_empty());
        assert_eq!(router.get_module("m1").unwrap().missed_heartbeats, 2);

        let report = router.sweep_at(30_000);
        assert_eq!(report.removed, vec!["m1"]);
        assert!(router.get_module("m1").is_none());
    }

    #[test]
    fn heartbeat_recovers_unhealthy_instance() {
        let router = router();
        register(&router, "m1", 0);
        router.sweep_at(15_000);
        router
            .heartbeat_at("m1", HealthStatus::Healthy, None, 16_000)
            .unwrap();
        let m = router.get_module("m1").unwrap();
        assert_eq!(m.health_status, HealthStatus::Healthy);
        assert_eq!(m.missed_heartbeats, 0);
        assert!(router.route_connection(Protocol::MySql).is_ok());
    }

    #[test]
    fn draining_instance_stays_stopping() {
        let router = router();
        register(&router, "m1", 0);
        let _conn = router.route_connection(Protocol::MySql).unwrap();
        router.unregister_module("m1", true).unwrap();
        let ack = router
            .heartbeat_at("m1", HealthStatus::Healthy, None, 1_000)
            .unwrap();
        assert!(ack.draining);
        assert_eq!(ack.health_status, HealthStatus::Stopping);
    }

    #[test]
    fn sweep_reaps_drained_instances() {
        let router = router();
        register(&router, "m1", 0);
        let conn = router.route_connection(Protocol::MySql).unwrap();
        router.unregister_module("m1", true).unwrap();
        // Simulate a release that raced with the drain flag.
        std::mem::forget(conn);
        let entry = router.inner.read().get("m1").cloned().unwrap();
        entry.release();

        let report = router.sweep_at(1_000);
        assert_eq!(report.drained, vec!["m1"]);
        assert!(router.is_empty());
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let router = router();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(router.clone().run_sweeper(Duration::from_millis(10), rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

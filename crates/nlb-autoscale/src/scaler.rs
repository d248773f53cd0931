//! Autoscaler — per-policy state machine driven by periodic ticks.

use crate::error::{AutoscaleError, AutoscaleResult};
use crate::policy::{PressureFn, ScalingMetricsSample, ScalingPolicy, default_pressure};
use nlb_core::config::PolicyConfig;
use nlb_core::{InstanceId, MetricsSnapshot, Protocol, epoch_millis};
use nlb_router::Router;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callback type for delivering scale directives to the lifecycle system.
pub type ScaleCallback = Box<dyn Fn(ScaleDirective) -> BoxFuture + Send + Sync>;

type BoxFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Automatic,
    Manual,
}

/// Advisory request to change a pool's instance count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleDirective {
    pub protocol: Protocol,
    pub direction: ScaleDirection,
    pub from_instances: u32,
    pub to_instances: u32,
    pub source: TriggerSource,
    /// Mean pressure over the window that triggered an automatic directive.
    pub pressure: Option<f64>,
    /// Epoch milliseconds.
    pub at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Stable,
    Evaluating,
    Cooldown { until: Instant },
}

impl PolicyState {
    fn name(&self) -> &'static str {
        match self {
            PolicyState::Stable => "stable",
            PolicyState::Evaluating => "evaluating",
            PolicyState::Cooldown { .. } => "cooldown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScalingEvent {
    /// Epoch milliseconds.
    pub at: u64,
    pub protocol: Protocol,
    #[serde(flatten)]
    pub kind: ScalingEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScalingEventKind {
    Transition {
        from: &'static str,
        to: &'static str,
    },
    Directive(ScaleDirective),
    /// A directive was suppressed because it would leave the bounds.
    PolicyViolation {
        direction: ScaleDirection,
        instances: u32,
        min: u32,
        max: u32,
    },
}

/// Introspection view of one policy.
#[derive(Debug, Clone, Serialize)]
pub struct PolicyStats {
    pub policy: PolicyConfig,
    pub state: &'static str,
    pub cooldown_remaining_ms: u64,
    pub samples: usize,
    pub last_pressure: Option<f64>,
    pub last_directive: Option<ScaleDirective>,
}

fn transition(
    entry: &mut PolicyEntry,
    events: &mut Vec<(Protocol, ScalingEventKind)>,
    to: PolicyState,
) {
    let from = entry.state.name();
    entry.state = to;
    if from != to.name() {
        events.push((
            entry.policy.protocol,
            ScalingEventKind::Transition {
                from,
                to: to.name(),
            },
        ));
    }
}

struct PolicyEntry {
    config: PolicyConfig,
    policy: ScalingPolicy,
    state: PolicyState,
    window: VecDeque<ScalingMetricsSample>,
    samples_since_eval: usize,
    /// Latest snapshot per instance since the previous tick.
    pending: HashMap<InstanceId, MetricsSnapshot>,
    last_pressure: Option<f64>,
    last_directive: Option<ScaleDirective>,
}

impl PolicyEntry {
    fn new(config: PolicyConfig, policy: ScalingPolicy) -> Self {
        Self {
            window: VecDeque::with_capacity(policy.evaluation_window),
            config,
            policy,
            state: PolicyState::Stable,
            samples_since_eval: 0,
            pending: HashMap::new(),
            last_pressure: None,
            last_directive: None,
        }
    }

    fn push_sample(&mut self, sample: ScalingMetricsSample) {
        while self.window.len() >= self.policy.evaluation_window {
            self.window.pop_front();
        }
        self.window.push_back(sample);
        self.samples_since_eval += 1;
    }

    fn cooldown_remaining(&self, now: Instant) -> Duration {
        match self.state {
            PolicyState::Cooldown { until } => until.saturating_duration_since(now),
            _ => Duration::ZERO,
        }
    }
}

/// Evaluates streamed metrics against per-protocol policies and emits
/// scale directives.
pub struct Autoscaler {
    router: Router,
    policies: Mutex<HashMap<Protocol, PolicyEntry>>,
    history: Mutex<VecDeque<ScalingEvent>>,
    history_limit: usize,
    pressure_fn: PressureFn,
    scale_fn: Option<ScaleCallback>,
    /// Off when no evaluation loop drains the pending snapshots.
    automatic: bool,
}

impl Autoscaler {
    /// Create an autoscaler that reads instance counts from `router`.
    pub fn new(router: Router) -> Self {
        Self {
            router,
            policies: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            history_limit: 100,
            pressure_fn: Arc::new(default_pressure),
            scale_fn: None,
            automatic: true,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Replace the default weighted-mean pressure function.
    pub fn with_pressure_fn(mut self, f: PressureFn) -> Self {
        self.pressure_fn = f;
        self
    }

    /// Turn automatic evaluation on or off. While off, streamed metrics
    /// are discarded and only manual triggers produce directives.
    pub fn with_automatic(mut self, enabled: bool) -> Self {
        self.automatic = enabled;
        self
    }

    /// Set the callback that receives scale directives.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    fn policies(&self) -> MutexGuard<'_, HashMap<Protocol, PolicyEntry>> {
        self.policies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, protocol: Protocol, kind: ScalingEventKind) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_limit {
            history.pop_front();
        }
        history.push_back(ScalingEvent {
            at: epoch_millis(),
            protocol,
            kind,
        });
    }

    // ── Policies ───────────────────────────────────────────────────

    /// Install or replace the policy for `config.protocol`. Replacing a
    /// policy keeps its state and the newest samples that fit the window.
    pub fn set_policy(&self, config: PolicyConfig) -> AutoscaleResult<()> {
        let policy = ScalingPolicy::from_config(&config)?;
        let protocol = policy.protocol;
        let mut policies = self.policies();
        match policies.get_mut(&protocol) {
            Some(entry) => {
                while entry.window.len() > policy.evaluation_window {
                    entry.window.pop_front();
                }
                entry.config = config;
                entry.policy = policy;
            }
            None => {
                policies.insert(protocol, PolicyEntry::new(config, policy));
            }
        }
        info!(protocol = %protocol, "scaling policy set");
        Ok(())
    }

    pub fn remove_policy(&self, protocol: Protocol) -> bool {
        self.policies().remove(&protocol).is_some()
    }

    pub fn policy(&self, protocol: Protocol) -> Option<ScalingPolicy> {
        self.policies().get(&protocol).map(|e| e.policy.clone())
    }

    // ── Metrics intake ─────────────────────────────────────────────

    /// Stash an instance's latest metrics for the next tick. Returns
    /// `false` if no policy covers `protocol` or automatic evaluation is off.
    pub fn record_metrics(
        &self,
        protocol: Protocol,
        instance_id: &str,
        snapshot: MetricsSnapshot,
    ) -> bool {
        if !self.automatic {
            return false;
        }
        match self.policies().get_mut(&protocol) {
            Some(entry) => {
                entry.pending.insert(instance_id.to_string(), snapshot);
                true
            }
            None => false,
        }
    }

    /// Append an already-aggregated sample to a policy's window.
    pub fn record_sample(&self, protocol: Protocol, sample: ScalingMetricsSample) -> bool {
        match self.policies().get_mut(&protocol) {
            Some(entry) => {
                entry.push_sample(sample);
                true
            }
            None => false,
        }
    }

    // ── Evaluation ─────────────────────────────────────────────────

    /// Run one evaluation pass for every policy and deliver the resulting
    /// directives.
    pub async fn tick(&self) -> Vec<ScaleDirective> {
        let router = self.router.clone();
        let directives = self.evaluate_at(Instant::now(), |p| router.instance_count(p));
        for d in &directives {
            self.deliver(d.clone()).await;
        }
        directives
    }

    /// Advance every policy's state machine as of `now`. `instances`
    /// reports the current pool size per protocol. Pure with respect to
    /// the outside world: directives are returned, not delivered.
    pub fn evaluate_at(
        &self,
        now: Instant,
        instances: impl Fn(Protocol) -> u32,
    ) -> Vec<ScaleDirective> {
        let mut directives = Vec::new();
        let mut events = Vec::new();
        {
            let mut policies = self.policies();
            let mut protocols: Vec<Protocol> = policies.keys().copied().collect();
            protocols.sort();
            for protocol in protocols {
                let Some(entry) = policies.get_mut(&protocol) else {
                    continue;
                };
                let current = instances(protocol);
                if let Some(d) = self.evaluate_policy(entry, current, now, &mut events) {
                    directives.push(d);
                }
            }
        }
        for (protocol, kind) in events {
            self.record(protocol, kind);
        }
        directives
    }

    fn evaluate_policy(
        &self,
        entry: &mut PolicyEntry,
        current: u32,
        now: Instant,
        events: &mut Vec<(Protocol, ScalingEventKind)>,
    ) -> Option<ScaleDirective> {
        let protocol = entry.policy.protocol;
        let fresh: Vec<MetricsSnapshot> = entry.pending.drain().map(|(_, s)| s).collect();
        if let Some(sample) = ScalingMetricsSample::aggregate(&fresh, current, epoch_millis()) {
            entry.push_sample(sample);
        }

        if let PolicyState::Cooldown { until } = entry.state {
            if now < until {
                return None;
            }
            transition(entry, events, PolicyState::Stable);
        }

        if entry.samples_since_eval == 0 {
            return None;
        }
        entry.samples_since_eval = 0;
        transition(entry, events, PolicyState::Evaluating);

        let policy = entry.policy.clone();
        if entry.window.len() < policy.evaluation_window {
            transition(entry, events, PolicyState::Stable);
            return None;
        }

        let pressures: Vec<f64> = entry
            .window
            .iter()
            .map(|s| (self.pressure_fn)(s, &policy))
            .collect();
        let mean = pressures.iter().sum::<f64>() / pressures.len() as f64;
        entry.last_pressure = Some(mean);

        let direction = if pressures.iter().all(|&p| p > policy.scale_up_threshold) {
            ScaleDirection::Up
        } else if pressures.iter().all(|&p| p < policy.scale_down_threshold) {
            ScaleDirection::Down
        } else {
            debug!(protocol = %protocol, pressure = mean, "pressure within thresholds");
            transition(entry, events, PolicyState::Stable);
            return None;
        };

        // A pool already outside the bounds is pulled back into them.
        let target = match direction {
            ScaleDirection::Up => current.saturating_add(policy.scale_up_step),
            ScaleDirection::Down => current.saturating_sub(policy.scale_down_step),
        }
        .clamp(policy.min_instances, policy.max_instances);
        let moves_right_way = match direction {
            ScaleDirection::Up => target > current,
            ScaleDirection::Down => target < current,
        };
        if !moves_right_way {
            warn!(
                protocol = %protocol,
                ?direction,
                instances = current,
                min = policy.min_instances,
                max = policy.max_instances,
                pressure = mean,
                "scale directive dropped: outside policy bounds"
            );
            events.push((
                protocol,
                ScalingEventKind::PolicyViolation {
                    direction,
                    instances: current,
                    min: policy.min_instances,
                    max: policy.max_instances,
                },
            ));
            transition(entry, events, PolicyState::Stable);
            return None;
        }

        let directive = ScaleDirective {
            protocol,
            direction,
            from_instances: current,
            to_instances: target,
            source: TriggerSource::Automatic,
            pressure: Some(mean),
            at: epoch_millis(),
        };
        info!(
            protocol = %protocol,
            ?direction,
            from = current,
            to = target,
            pressure = mean,
            "scale directive issued"
        );
        let cooldown = PolicyState::Cooldown {
            until: now + policy.cooldown,
        };
        entry.window.clear();
        entry.last_directive = Some(directive.clone());
        events.push((protocol, ScalingEventKind::Directive(directive.clone())));
        transition(entry, events, cooldown);
        Some(directive)
    }

    /// Manually request `target` instances for `protocol`. The request is
    /// held to the same bounds and cooldown as automatic directives.
    pub async fn trigger_scaling(
        &self,
        protocol: Protocol,
        target: u32,
    ) -> AutoscaleResult<ScaleDirective> {
        let current = self.router.instance_count(protocol);
        let directive = self.trigger_scaling_at(protocol, target, current, Instant::now())?;
        self.deliver(directive.clone()).await;
        Ok(directive)
    }

    pub fn trigger_scaling_at(
        &self,
        protocol: Protocol,
        target: u32,
        current: u32,
        now: Instant,
    ) -> AutoscaleResult<ScaleDirective> {
        let directive = {
            let mut policies = self.policies();
            let entry = policies
                .get_mut(&protocol)
                .ok_or(AutoscaleError::UnknownPolicy(protocol))?;
            let policy = &entry.policy;

            if target < policy.min_instances || target > policy.max_instances {
                return Err(AutoscaleError::PolicyViolation {
                    protocol,
                    target,
                    min: policy.min_instances,
                    max: policy.max_instances,
                });
            }
            let remaining = entry.cooldown_remaining(now);
            if !remaining.is_zero() {
                return Err(AutoscaleError::CoolingDown {
                    protocol,
                    remaining,
                });
            }
            if target == current {
                return Err(AutoscaleError::NoChange {
                    protocol,
                    instances: current,
                });
            }

            let directive = ScaleDirective {
                protocol,
                direction: if target > current {
                    ScaleDirection::Up
                } else {
                    ScaleDirection::Down
                },
                from_instances: current,
                to_instances: target,
                source: TriggerSource::Manual,
                pressure: None,
                at: epoch_millis(),
            };
            entry.state = PolicyState::Cooldown {
                until: now + policy.cooldown,
            };
            entry.window.clear();
            entry.samples_since_eval = 0;
            entry.last_directive = Some(directive.clone());
            directive
        };

        info!(
            protocol = %protocol,
            from = current,
            to = target,
            "manual scale directive issued"
        );
        self.record(protocol, ScalingEventKind::Directive(directive.clone()));
        Ok(directive)
    }

    async fn deliver(&self, directive: ScaleDirective) {
        let Some(scale_fn) = &self.scale_fn else {
            return;
        };
        let protocol = directive.protocol;
        let target = directive.to_instances;
        if let Err(e) = scale_fn(directive).await {
            warn!(
                protocol = %protocol,
                target,
                error = %e,
                "scaling action failed"
            );
        }
    }

    // ── Introspection ──────────────────────────────────────────────

    /// Most recent directive for `protocol`, automatic or manual.
    pub fn last_directive(&self, protocol: Protocol) -> Option<ScaleDirective> {
        self.policies()
            .get(&protocol)
            .and_then(|e| e.last_directive.clone())
    }

    pub fn stats(&self, protocol: Protocol) -> Option<PolicyStats> {
        let now = Instant::now();
        self.policies()
            .get(&protocol)
            .map(|e| Self::stats_for(e, now))
    }

    pub fn all_stats(&self) -> Vec<PolicyStats> {
        let now = Instant::now();
        let mut out: Vec<PolicyStats> = self
            .policies()
            .values()
            .map(|e| Self::stats_for(e, now))
            .collect();
        out.sort_by_key(|s| s.policy.protocol);
        out
    }

    fn stats_for(entry: &PolicyEntry, now: Instant) -> PolicyStats {
        PolicyStats {
            policy: entry.config.clone(),
            state: entry.state.name(),
            cooldown_remaining_ms: entry.cooldown_remaining(now).as_millis() as u64,
            samples: entry.window.len(),
            last_pressure: entry.last_pressure,
            last_directive: entry.last_directive.clone(),
        }
    }

    /// Recorded transitions and directives, oldest first.
    pub fn history(&self, protocol: Option<Protocol>) -> Vec<ScalingEvent> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| protocol.is_none_or(|p| p == e.protocol))
            .cloned()
            .collect()
    }

    /// Run the autoscaler loop.
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "autoscaler started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let directives = self.tick().await;
                    if !directives.is_empty() {
                        debug!(count = directives.len(), "autoscaler tick issued directives");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(protocol: Protocol) -> PolicyConfig {
        PolicyConfig {
            protocol,
            min_instances: 1,
            max_instances: 4,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            cooldown: "60s".to_string(),
            evaluation_window: 3,
            ..Default::default()
        }
    }

    fn sample(cpu: f64) -> ScalingMetricsSample {
        // cpu drives all three components equally.
        ScalingMetricsSample {
            cpu_percent: cpu,
            memory_percent: cpu,
            connections: (cpu * 10.0) as u64,
            instances: 1,
            ..Default::default()
        }
    }

    fn scaler() -> Autoscaler {
        let s = Autoscaler::new(Router::new());
        s.set_policy(policy(Protocol::Http)).unwrap();
        s
    }

    /// Push one sample and tick.
    fn step(s: &Autoscaler, cpu: f64, instances: u32, now: Instant) -> Vec<ScaleDirective> {
        s.record_sample(Protocol::Http, sample(cpu));
        s.evaluate_at(now, |_| instances)
    }

    #[test]
    fn sustained_pressure_scales_up_once_per_cooldown() {
        let s = scaler();
        let t0 = Instant::now();

        assert!(step(&s, 95.0, 2, t0).is_empty());
        assert!(step(&s, 95.0, 2, t0).is_empty());
        let d = step(&s, 95.0, 2, t0);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].direction, ScaleDirection::Up);
        assert_eq!((d[0].from_instances, d[0].to_instances), (2, 3));
        assert_eq!(d[0].source, TriggerSource::Automatic);
        assert_eq!(s.stats(Protocol::Http).unwrap().state, "cooldown");

        // Inside the cooldown nothing fires, however hot.
        let t1 = t0 + Duration::from_secs(30);
        for _ in 0..5 {
            assert!(step(&s, 99.0, 3, t1).is_empty());
        }
        // Samples kept accumulating, so the first tick after cooldown fires.
        let t2 = t0 + Duration::from_secs(60);
        let d = step(&s, 99.0, 3, t2);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].to_instances, 4);
    }

    #[test]
    fn one_cool_sample_blocks_scale_up() {
        let s = scaler();
        let t0 = Instant::now();
        step(&s, 95.0, 2, t0);
        step(&s, 50.0, 2, t0);
        assert!(step(&s, 95.0, 2, t0).is_empty());
        assert!(step(&s, 95.0, 2, t0).is_empty());
        assert_eq!(step(&s, 95.0, 2, t0).len(), 1);
    }

    #[test]
    fn no_new_samples_means_no_evaluation() {
        let s = scaler();
        let t0 = Instant::now();
        step(&s, 95.0, 2, t0);
        step(&s, 95.0, 2, t0);
        s.record_sample(Protocol::Http, sample(95.0));
        assert_eq!(s.evaluate_at(t0, |_| 2).len(), 1);
        let t1 = t0 + Duration::from_secs(120);
        assert!(s.evaluate_at(t1, |_| 3).is_empty());
    }

    #[test]
    fn never_scales_above_max() {
        let s = scaler();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert!(step(&s, 99.0, 4, t0).is_empty());
        }
        let history = s.history(Some(Protocol::Http));
        assert!(
            history
                .iter()
                .any(|e| matches!(e.kind, ScalingEventKind::PolicyViolation { .. }))
        );
        assert!(s.last_directive(Protocol::Http).is_none());
    }

    fn bounded(min: u32, max: u32) -> Autoscaler {
        let s = Autoscaler::new(Router::new());
        s.set_policy(PolicyConfig {
            min_instances: min,
            max_instances: max,
            evaluation_window: 1,
            ..policy(Protocol::Http)
        })
        .unwrap();
        s
    }

    #[test]
    fn scale_up_below_min_lands_on_min() {
        let s = bounded(2, 4);
        let d = step(&s, 95.0, 0, Instant::now());
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].direction, ScaleDirection::Up);
        assert_eq!((d[0].from_instances, d[0].to_instances), (0, 2));
    }

    #[test]
    fn scale_down_above_max_lands_on_max() {
        let s = bounded(2, 4);
        let d = step(&s, 5.0, 6, Instant::now());
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].direction, ScaleDirection::Down);
        assert_eq!((d[0].from_instances, d[0].to_instances), (6, 4));
    }

    #[test]
    fn out_of_bounds_pool_is_not_pushed_further_out() {
        // Hot but already above max: no scale-up, and no scale-down either.
        let s = bounded(2, 4);
        assert!(step(&s, 99.0, 6, Instant::now()).is_empty());
        // Idle but already below min.
        let s = bounded(2, 4);
        assert!(step(&s, 1.0, 1, Instant::now()).is_empty());
        assert!(
            s.history(Some(Protocol::Http))
                .iter()
                .any(|e| matches!(e.kind, ScalingEventKind::PolicyViolation { .. }))
        );
    }

    #[test]
    fn scale_down_stops_at_min() {
        let s = scaler();
        let mut now = Instant::now();
        let mut instances = 4;
        let mut directives = Vec::new();
        for _ in 0..40 {
            let d = step(&s, 5.0, instances, now);
            for d in d {
                assert_eq!(d.direction, ScaleDirection::Down);
                instances = d.to_instances;
                directives.push(d);
            }
            now += Duration::from_secs(30);
        }
        assert_eq!(instances, 1);
        assert_eq!(directives.len(), 3);
    }

    #[test]
    fn directives_respect_cooldown_spacing() {
        let s = scaler();
        let start = Instant::now();
        let mut fired_at = Vec::new();
        let mut instances = 1;
        for i in 0..200u64 {
            let now = start + Duration::from_secs(i * 7);
            let cpu = if (i / 20) % 2 == 0 { 97.0 } else { 2.0 };
            for d in step(&s, cpu, instances, now) {
                assert!(d.to_instances >= 1 && d.to_instances <= 4);
                instances = d.to_instances;
                fired_at.push(now);
            }
        }
        assert!(fired_at.len() >= 2);
        for pair in fired_at.windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(60));
        }
    }

    #[test]
    fn pending_metrics_are_folded_per_tick() {
        let s = scaler();
        let t0 = Instant::now();
        let hot = MetricsSnapshot {
            cpu_percent: 95.0,
            memory_percent: 95.0,
            active_connections: 2_000,
            latency_ms: 5.0,
        };
        for _ in 0..3 {
            assert!(s.record_metrics(Protocol::Http, "a", hot));
            assert!(s.record_metrics(Protocol::Http, "b", hot));
            let d = s.evaluate_at(t0, |_| 2);
            if !d.is_empty() {
                assert_eq!(d[0].to_instances, 3);
            }
        }
        assert!(s.last_directive(Protocol::Http).is_some());
        assert!(!s.record_metrics(Protocol::Redis, "r", hot));
    }

    #[test]
    fn manual_only_mode_discards_metrics() {
        let s = Autoscaler::new(Router::new()).with_automatic(false);
        s.set_policy(policy(Protocol::Http)).unwrap();
        let hot = MetricsSnapshot {
            cpu_percent: 95.0,
            ..Default::default()
        };
        assert!(!s.record_metrics(Protocol::Http, "a", hot));
        assert!(s.evaluate_at(Instant::now(), |_| 2).is_empty());
        assert_eq!(s.stats(Protocol::Http).unwrap().samples, 0);
        // Manual triggers still work.
        assert!(s.trigger_scaling_at(Protocol::Http, 3, 2, Instant::now()).is_ok());
    }

    #[test]
    fn manual_trigger_obeys_bounds_and_cooldown() {
        let s = scaler();
        let t0 = Instant::now();
        assert_eq!(
            s.trigger_scaling_at(Protocol::Http, 9, 2, t0),
            Err(AutoscaleError::PolicyViolation {
                protocol: Protocol::Http,
                target: 9,
                min: 1,
                max: 4,
            })
        );
        assert!(matches!(
            s.trigger_scaling_at(Protocol::Http, 2, 2, t0),
            Err(AutoscaleError::NoChange { .. })
        ));
        assert_eq!(
            s.trigger_scaling_at(Protocol::Redis, 2, 1, t0),
            Err(AutoscaleError::UnknownPolicy(Protocol::Redis))
        );

        let d = s.trigger_scaling_at(Protocol::Http, 4, 2, t0).unwrap();
        assert_eq!(d.source, TriggerSource::Manual);
        assert_eq!(d.direction, ScaleDirection::Up);

        let t1 = t0 + Duration::from_secs(10);
        assert!(matches!(
            s.trigger_scaling_at(Protocol::Http, 3, 4, t1),
            Err(AutoscaleError::CoolingDown { .. })
        ));
        // Automatic evaluation is held back by the same cooldown.
        for _ in 0..3 {
            assert!(step(&s, 1.0, 4, t1).is_empty());
        }
        let t2 = t0 + Duration::from_secs(60);
        assert!(s.trigger_scaling_at(Protocol::Http, 3, 4, t2).is_ok());
    }

    #[test]
    fn custom_pressure_function() {
        let s = Autoscaler::new(Router::new())
            .with_pressure_fn(Arc::new(|sample, _| sample.latency_ms / 100.0));
        s.set_policy(policy(Protocol::Postgres)).unwrap();
        let t0 = Instant::now();
        let slow = ScalingMetricsSample {
            latency_ms: 90.0,
            ..Default::default()
        };
        let mut fired = Vec::new();
        for _ in 0..3 {
            s.record_sample(Protocol::Postgres, slow);
            fired.extend(s.evaluate_at(t0, |_| 1));
        }
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].protocol, Protocol::Postgres);
    }

    #[test]
    fn replacing_policy_trims_window() {
        let s = scaler();
        let t0 = Instant::now();
        step(&s, 95.0, 2, t0);
        step(&s, 95.0, 2, t0);
        let mut narrow = policy(Protocol::Http);
        narrow.evaluation_window = 1;
        s.set_policy(narrow).unwrap();
        assert_eq!(s.stats(Protocol::Http).unwrap().samples, 1);
        assert_eq!(step(&s, 95.0, 2, t0).len(), 1);
    }

    #[test]
    fn history_is_bounded() {
        let s = Autoscaler::new(Router::new()).with_history_limit(4);
        s.set_policy(policy(Protocol::Http)).unwrap();
        let t0 = Instant::now();
        for _ in 0..20 {
            step(&s, 50.0, 2, t0);
        }
        assert_eq!(s.history(None).len(), 4);
    }

    #[tokio::test]
    async fn tick_delivers_directives_to_callback() {
        let router = Router::new();
        for id in ["a", "b"] {
            router
                .register_module(nlb_router::Registration::new(
                    id,
                    Protocol::Http,
                    "127.0.0.1:1",
                ))
                .unwrap();
        }
        let delivered = Arc::new(AtomicU32::new(0));
        let seen = delivered.clone();
        let s = Autoscaler::new(router).with_scale_fn(Box::new(move |d| {
            let seen = seen.clone();
            Box::pin(async move {
                seen.store(d.to_instances, Ordering::SeqCst);
                Ok(())
            })
        }));
        s.set_policy(policy(Protocol::Http)).unwrap();
        for _ in 0..3 {
            s.record_sample(Protocol::Http, sample(95.0));
            s.tick().await;
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 3);

        let d = s.trigger_scaling(Protocol::Http, 1).await;
        assert!(matches!(d, Err(AutoscaleError::CoolingDown { .. })));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let s = Arc::new(scaler());
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(s.clone().run(Duration::from_millis(5), rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

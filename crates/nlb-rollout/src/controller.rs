//! Blue/green controller — owns per-protocol deployment state and keeps
//! the router's per-version weights in step with it.

use crate::affinity::AffinityKey;
use crate::deployment::{DeploymentState, WeightChange};
use crate::error::{RolloutError, RolloutResult};
use nlb_core::config::RolloutConfig;
use nlb_core::{Color, Protocol, epoch_millis};
use nlb_router::Router;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

pub struct BlueGreenController {
    router: Router,
    deployments: RwLock<HashMap<Protocol, DeploymentState>>,
    history_limit: usize,
}

impl BlueGreenController {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            deployments: RwLock::new(HashMap::new()),
            history_limit: 100,
        }
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Build a controller and initialize the deployments listed in
    /// `config`, starting their canary schedules where one is given.
    pub fn from_config(router: Router, config: &RolloutConfig) -> RolloutResult<Self> {
        let controller = Self::new(router).with_history_limit(config.history_limit);
        for seed in &config.deployments {
            controller.initialize_deployment(seed.protocol, &seed.blue, &seed.green)?;
            if let Some(steps) = &seed.canary_steps {
                controller.start_canary(seed.protocol, steps)?;
            }
        }
        Ok(controller)
    }

    /// Create (or reset) the deployment for `protocol` with all traffic on
    /// `blue`.
    pub fn initialize_deployment(
        &self,
        protocol: Protocol,
        blue: &str,
        green: &str,
    ) -> RolloutResult<DeploymentState> {
        let state =
            DeploymentState::new(protocol, blue, green, self.history_limit, epoch_millis())?;
        let mut deployments = self.deployments.write().unwrap_or_else(PoisonError::into_inner);
        self.router.set_version_weights(protocol, &state.version_weights());
        deployments.insert(protocol, state.clone());
        info!(
            protocol = %protocol,
            blue = %state.blue_version,
            green = %state.green_version,
            "deployment initialized"
        );
        Ok(state)
    }

    pub fn start_canary(&self, protocol: Protocol, steps: &[u8]) -> RolloutResult<DeploymentState> {
        let state = self.update(protocol, |d, now| d.start_canary(steps, now))?;
        info!(
            protocol = %protocol,
            ?steps,
            blue_weight = state.blue_weight,
            green_weight = state.green_weight,
            "canary deployment started"
        );
        Ok(state)
    }

    /// Move to the next canary step.
    pub fn promote_version(&self, protocol: Protocol) -> RolloutResult<DeploymentState> {
        let state = self.update(protocol, |d, now| d.promote(now))?;
        info!(
            protocol = %protocol,
            blue_weight = state.blue_weight,
            green_weight = state.green_weight,
            status = ?state.status,
            "canary promoted"
        );
        Ok(state)
    }

    pub fn instant_switch(
        &self,
        protocol: Protocol,
        color: Color,
    ) -> RolloutResult<DeploymentState> {
        let state = self.update(protocol, |d, now| {
            d.switch_to(color, now);
            Ok(())
        })?;
        info!(
            protocol = %protocol,
            color = %color,
            version = %state.version(color),
            "instant switch completed"
        );
        Ok(state)
    }

    /// Switch all traffic to whichever color runs `version`.
    pub fn instant_switch_to_version(
        &self,
        protocol: Protocol,
        version: &str,
    ) -> RolloutResult<DeploymentState> {
        let color = {
            let deployments = self.deployments.read().unwrap_or_else(PoisonError::into_inner);
            let d = deployments
                .get(&protocol)
                .ok_or(RolloutError::NotInitialized(protocol))?;
            d.color_of(version).ok_or_else(|| RolloutError::UnknownVersion {
                protocol,
                version: version.to_string(),
            })?
        };
        self.instant_switch(protocol, color)
    }

    pub fn set_traffic_weight(
        &self,
        protocol: Protocol,
        blue: u8,
        green: u8,
    ) -> RolloutResult<DeploymentState> {
        let state = self.update(protocol, |d, now| d.set_weights(blue, green, now))?;
        info!(
            protocol = %protocol,
            blue_weight = blue,
            green_weight = green,
            status = ?state.status,
            "traffic weights set"
        );
        Ok(state)
    }

    /// Revert to the last known-good split. Available from any state.
    pub fn rollback(&self, protocol: Protocol) -> RolloutResult<DeploymentState> {
        let state = self.update(protocol, |d, now| {
            d.rollback(now);
            Ok(())
        })?;
        warn!(
            protocol = %protocol,
            color = %state.stable_color,
            version = %state.version(state.stable_color),
            "deployment rolled back"
        );
        Ok(state)
    }

    /// Color for a connection identified by `key`. The same key always
    /// lands on the same color for a given split.
    pub fn should_route_to_color<K: AffinityKey + ?Sized>(
        &self,
        protocol: Protocol,
        key: &K,
    ) -> RolloutResult<Color> {
        let hash = key.affinity_hash();
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .map(|d| d.color_for(hash))
            .ok_or(RolloutError::NotInitialized(protocol))
    }

    /// Version a connection identified by `key` should prefer, or `None`
    /// when `protocol` has no deployment.
    pub fn version_for<K: AffinityKey + ?Sized>(
        &self,
        protocol: Protocol,
        key: &K,
    ) -> Option<String> {
        let hash = key.affinity_hash();
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .map(|d| d.version(d.color_for(hash)).to_string())
    }

    pub fn get(&self, protocol: Protocol) -> Option<DeploymentState> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .cloned()
    }

    pub fn all(&self) -> Vec<DeploymentState> {
        let mut out: Vec<DeploymentState> = self
            .deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by_key(|d| d.protocol);
        out
    }

    pub fn history(&self, protocol: Protocol) -> RolloutResult<Vec<WeightChange>> {
        self.deployments
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&protocol)
            .map(|d| d.history.iter().cloned().collect())
            .ok_or(RolloutError::NotInitialized(protocol))
    }

    pub fn active_color(&self, protocol: Protocol) -> Option<Color> {
        self.get(protocol).map(|d| d.stable_color)
    }

    /// Apply `f` under the write lock and push the resulting split to the
    /// router before the lock is released. A failed transition leaves the
    /// state untouched.
    fn update<F>(&self, protocol: Protocol, f: F) -> RolloutResult<DeploymentState>
    where
        F: FnOnce(&mut DeploymentState, u64) -> RolloutResult<()>,
    {
        let mut deployments = self.deployments.write().unwrap_or_else(PoisonError::into_inner);
        let current = deployments
            .get_mut(&protocol)
            .ok_or(RolloutError::NotInitialized(protocol))?;
        let mut next = current.clone();
        f(&mut next, epoch_millis())?;
        self.router.set_version_weights(protocol, &next.version_weights());
        *current = next.clone();
        Ok(next)
    }
}

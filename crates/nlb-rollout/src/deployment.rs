//! Deployment state and its transitions.
//!
//! Everything here is a plain state transition stamped with a caller
//! supplied clock; [`BlueGreenController`](crate::BlueGreenController)
//! adds locking, logging and the push into the router.

use crate::error::{RolloutError, RolloutResult};
use nlb_core::config::validate_canary_steps;
use nlb_core::{Color, Protocol};
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    Instant,
    Canary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Active,
    Transitioning,
    RolledBack,
}

/// One entry in a deployment's weight history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeightChange {
    /// Epoch milliseconds.
    pub at: u64,
    pub action: &'static str,
    pub blue_version: String,
    pub green_version: String,
    pub blue_weight: u8,
    pub green_weight: u8,
    pub status: DeploymentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentState {
    pub protocol: Protocol,
    pub blue_version: String,
    pub green_version: String,
    pub blue_weight: u8,
    pub green_weight: u8,
    pub mode: DeploymentMode,
    pub status: DeploymentStatus,
    /// Canary schedule: percentages of traffic for the canary color.
    pub steps: Vec<u8>,
    /// Index of the applied step while a canary is in flight.
    pub current_step: Option<usize>,
    /// Color that held 100% at the last known-good point.
    pub stable_color: Color,
    #[serde(skip)]
    previous_stable: Option<Color>,
    pub created_at: u64,
    pub updated_at: u64,
    pub history: VecDeque<WeightChange>,
    #[serde(skip)]
    history_limit: usize,
}

impl DeploymentState {
    /// Blue takes all traffic; green is staged.
    pub fn new(
        protocol: Protocol,
        blue_version: &str,
        green_version: &str,
        history_limit: usize,
        now: u64,
    ) -> RolloutResult<Self> {
        let blue = blue_version.trim();
        let green = green_version.trim();
        if blue.is_empty() || green.is_empty() {
            return Err(RolloutError::InvalidVersions(
                "blue and green versions must not be empty".to_string(),
            ));
        }
        if blue == green {
            return Err(RolloutError::InvalidVersions(format!(
                "blue and green must differ (both {blue})"
            )));
        }
        let mut state = Self {
            protocol,
            blue_version: blue.to_string(),
            green_version: green.to_string(),
            blue_weight: 100,
            green_weight: 0,
            mode: DeploymentMode::Instant,
            status: DeploymentStatus::Active,
            steps: Vec::new(),
            current_step: None,
            stable_color: Color::Blue,
            previous_stable: None,
            created_at: now,
            updated_at: now,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        };
        state.record("initialized", now);
        Ok(state)
    }

    pub fn weight(&self, color: Color) -> u8 {
        match color {
            Color::Blue => self.blue_weight,
            Color::Green => self.green_weight,
        }
    }

    pub fn version(&self, color: Color) -> &str {
        match color {
            Color::Blue => &self.blue_version,
            Color::Green => &self.green_version,
        }
    }

    pub fn color_of(&self, version: &str) -> Option<Color> {
        if version == self.blue_version {
            Some(Color::Blue)
        } else if version == self.green_version {
            Some(Color::Green)
        } else {
            None
        }
    }

    /// Per-version weights in the form the router takes.
    pub fn version_weights(&self) -> Vec<(String, u8)> {
        vec![
            (self.blue_version.clone(), self.blue_weight),
            (self.green_version.clone(), self.green_weight),
        ]
    }

    /// Color a connection whose affinity key hashed to `hash` should use.
    pub fn color_for(&self, hash: u64) -> Color {
        if hash % 100 < u64::from(self.blue_weight) {
            Color::Blue
        } else {
            Color::Green
        }
    }

    /// Begin shifting traffic from the stable color to the other one,
    /// applying the first step immediately.
    pub fn start_canary(&mut self, steps: &[u8], now: u64) -> RolloutResult<()> {
        if self.status == DeploymentStatus::Transitioning {
            return Err(RolloutError::AlreadyTransitioning(self.protocol));
        }
        validate_canary_steps(steps).map_err(RolloutError::InvalidSteps)?;

        self.mode = DeploymentMode::Canary;
        self.steps = steps.to_vec();
        self.current_step = Some(0);
        self.status = DeploymentStatus::Transitioning;
        self.apply_canary(steps[0]);
        self.record("canary_started", now);
        if steps[0] == 100 {
            self.complete(now);
        }
        Ok(())
    }

    /// Advance one canary step. Promoting past the last step sends all
    /// traffic to the canary color.
    pub fn promote(&mut self, now: u64) -> RolloutResult<()> {
        let idx = match (self.status, self.current_step) {
            (DeploymentStatus::Transitioning, Some(idx)) => idx,
            _ => return Err(RolloutError::NotTransitioning(self.protocol)),
        };
        let next = idx + 1;
        let percent = self.steps.get(next).copied().unwrap_or(100);
        self.current_step = Some(next.min(self.steps.len().saturating_sub(1)));
        self.apply_canary(percent);
        self.record("promoted", now);
        if percent == 100 {
            self.complete(now);
        }
        Ok(())
    }

    /// Set an explicit split. A 100/0 or 0/100 split becomes the new
    /// known-good point; anything else leaves the deployment transitioning.
    pub fn set_weights(&mut self, blue: u8, green: u8, now: u64) -> RolloutResult<()> {
        if u16::from(blue) + u16::from(green) != 100 {
            return Err(RolloutError::InvalidWeightConfiguration { blue, green });
        }
        self.mode = DeploymentMode::Instant;
        self.steps.clear();
        self.current_step = None;
        self.blue_weight = blue;
        self.green_weight = green;
        match (blue, green) {
            (100, _) => self.settle(Color::Blue),
            (_, 100) => self.settle(Color::Green),
            _ => self.status = DeploymentStatus::Transitioning,
        }
        self.record("weights_set", now);
        Ok(())
    }

    /// Send all traffic to `color`, skipping any remaining canary steps.
    pub fn switch_to(&mut self, color: Color, now: u64) {
        self.mode = DeploymentMode::Instant;
        self.steps.clear();
        self.current_step = None;
        self.apply_full(color);
        self.settle(color);
        self.record("instant_switch", now);
    }

    /// Revert to the last known-good split. While transitioning that is
    /// the split the transition started from; otherwise it is the stable
    /// point before the current one.
    pub fn rollback(&mut self, now: u64) -> Color {
        let target = match self.status {
            DeploymentStatus::Transitioning => self.stable_color,
            _ => self.previous_stable.unwrap_or(self.stable_color),
        };
        if target != self.stable_color {
            self.previous_stable = Some(self.stable_color);
            self.stable_color = target;
        }
        self.steps.clear();
        self.current_step = None;
        self.apply_full(target);
        self.status = DeploymentStatus::RolledBack;
        self.record("rollback", now);
        target
    }

    fn canary_color(&self) -> Color {
        self.stable_color.other()
    }

    fn apply_canary(&mut self, percent: u8) {
        let percent = percent.min(100);
        match self.canary_color() {
            Color::Green => {
                self.green_weight = percent;
                self.blue_weight = 100 - percent;
            }
            Color::Blue => {
                self.blue_weight = percent;
                self.green_weight = 100 - percent;
            }
        }
    }

    fn apply_full(&mut self, color: Color) {
        let (blue, green) = match color {
            Color::Blue => (100, 0),
            Color::Green => (0, 100),
        };
        self.blue_weight = blue;
        self.green_weight = green;
    }

    fn settle(&mut self, color: Color) {
        if color != self.stable_color {
            self.previous_stable = Some(self.stable_color);
            self.stable_color = color;
        }
        self.status = DeploymentStatus::Active;
    }

    fn complete(&mut self, now: u64) {
        let color = self.canary_color();
        self.current_step = None;
        self.settle(color);
        self.record("completed", now);
    }

    fn record(&mut self, action: &'static str, now: u64) {
        self.updated_at = now;
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(WeightChange {
            at: now,
            action,
            blue_version: self.blue_version.clone(),
            green_version: self.green_version.clone(),
            blue_weight: self.blue_weight,
            green_weight: self.green_weight,
            status: self.status,
        });
    }
}

//! Shared vocabulary for the load balancer crates.
//!
//! These types cross every crate boundary: the inspector produces a
//! [`Protocol`], the router keys its registry on it, and modules report
//! [`HealthStatus`] and [`MetricsSnapshot`] through the registration API.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Unique identifier of a module instance.
pub type InstanceId = String;

// ── Protocol ───────────────────────────────────────────────────────

/// Wire protocols the load balancer can classify and route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Redis,
    MySql,
    Postgres,
    MongoDb,
    Rtmp,
}

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::Http,
        Protocol::Redis,
        Protocol::MySql,
        Protocol::Postgres,
        Protocol::MongoDb,
        Protocol::Rtmp,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Redis => "redis",
            Protocol::MySql => "mysql",
            Protocol::Postgres => "postgres",
            Protocol::MongoDb => "mongodb",
            Protocol::Rtmp => "rtmp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProtocol(pub String);

impl fmt::Display for UnknownProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown protocol: {}", self.0)
    }
}

impl std::error::Error for UnknownProtocol {}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "http2" | "h2" => Ok(Protocol::Http),
            "redis" | "resp" => Ok(Protocol::Redis),
            "mysql" => Ok(Protocol::MySql),
            "postgres" | "postgresql" | "pg" => Ok(Protocol::Postgres),
            "mongodb" | "mongo" => Ok(Protocol::MongoDb),
            "rtmp" => Ok(Protocol::Rtmp),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// Health of a module instance as reported by heartbeats or derived from
/// heartbeat absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
    Stopping,
}

impl HealthStatus {
    /// Compact encoding for storage in an atomic.
    pub const fn as_u8(self) -> u8 {
        match self {
            HealthStatus::Starting => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Stopping => 4,
        }
    }

    /// Inverse of [`HealthStatus::as_u8`]. Out-of-range values decode as
    /// `Unhealthy` so a corrupted value never makes an entry routable.
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => HealthStatus::Starting,
            1 => HealthStatus::Healthy,
            2 => HealthStatus::Degraded,
            4 => HealthStatus::Stopping,
            _ => HealthStatus::Unhealthy,
        }
    }

    /// Whether connections may be routed to an instance in this state.
    pub const fn is_routable(self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

// ── Metrics ────────────────────────────────────────────────────────

/// Point-in-time resource usage reported by a module instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSnapshot {
    /// CPU utilization, 0.0 to 100.0.
    pub cpu_percent: f64,
    /// Memory utilization, 0.0 to 100.0.
    pub memory_percent: f64,
    /// Connections currently open on the instance.
    pub active_connections: u64,
    /// Mean request latency in milliseconds.
    pub latency_ms: f64,
}

// ── Pressure weights ───────────────────────────────────────────────

/// Coefficients of the default autoscaling pressure function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureWeights {
    pub cpu: f64,
    pub memory: f64,
    pub connections: f64,
}

impl Default for PressureWeights {
    fn default() -> Self {
        Self {
            cpu: 1.0,
            memory: 1.0,
            connections: 1.0,
        }
    }
}

// ── Blue/green colors ──────────────────────────────────────────────

/// One side of a blue/green deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub const fn other(self) -> Self {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Blue => f.write_str("blue"),
            Color::Green => f.write_str("green"),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

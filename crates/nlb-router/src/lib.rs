//! Traffic router.
//!
//! Owns the live, protocol-partitioned registry of module instances and
//! picks a target for each new connection. Other subsystems (blue/green
//! controller, heartbeat handling, autoscaler) hold a cloned [`Router`]
//! handle rather than a copy of the registry.

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod health;
pub mod registry;

pub use connection::RoutedConnection;
pub use endpoint::{ModuleEndpoint, Registration};
pub use error::{RouterError, RouterResult};
pub use events::{RegistryEvent, RegistryEventKind, RemovalReason};
pub use health::{HeartbeatAck, SweepReport};
pub use registry::{ProtocolStats, RegisterOutcome, Router};

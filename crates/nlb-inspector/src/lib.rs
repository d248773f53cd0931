//! Protocol inspector.
//!
//! Classifies a new connection from its first bytes by running a fixed
//! priority list of signature checks. Each check looks at a handful of
//! bytes at fixed offsets and never parses beyond them.

pub mod error;
pub mod inspector;
pub mod signatures;

pub use error::{InspectError, InspectResult};
pub use inspector::{Classification, DETECTION_ORDER, ProtocolInspector};

//! Simulated vehicle instances.
//!
//! - `types`: identifiers, variants and status snapshots
//! - `lifecycle`: the per-instance controller driving start/stop
//! - `handshake`: telemetry configuration over the vehicle's control channel

mod handshake;
mod lifecycle;
mod types;

pub use types::{FleetSnapshot, HandshakeOutcome, InstanceId, InstanceState, InstanceStatus, Variant};

pub use lifecycle::{ControllerDeps, InstanceController};

pub use handshake::{run_control_command, Handshake};

//! Instance-related type definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::ports::PortPair;

/// Monotonically assigned instance id, rendered as `instance_<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance_{}", self.0)
    }
}

impl Serialize for InstanceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Vehicle/simulation configurations the flight stack can be launched with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    #[serde(rename = "gz_x500")]
    X500,
    #[serde(rename = "gz_standard_vtol")]
    StandardVtol,
    #[serde(rename = "gz_rc_cessna")]
    RcCessna,
    #[serde(rename = "gz_advanced_plane")]
    AdvancedPlane,
    #[serde(rename = "gz_quadtailsitter")]
    Quadtailsitter,
    #[serde(rename = "gz_tiltrotor")]
    Tiltrotor,
    #[serde(rename = "gz_rover_differential")]
    RoverDifferential,
    #[serde(rename = "gz_rover_ackermann")]
    RoverAckermann,
    #[serde(rename = "gz_rover_mecanum")]
    RoverMecanum,
}

impl Variant {
    pub const ALL: [Self; 9] = [
        Self::X500,
        Self::StandardVtol,
        Self::RcCessna,
        Self::AdvancedPlane,
        Self::Quadtailsitter,
        Self::Tiltrotor,
        Self::RoverDifferential,
        Self::RoverAckermann,
        Self::RoverMecanum,
    ];

    /// The make target suffix, e.g. `gz_x500`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X500 => "gz_x500",
            Self::StandardVtol => "gz_standard_vtol",
            Self::RcCessna => "gz_rc_cessna",
            Self::AdvancedPlane => "gz_advanced_plane",
            Self::Quadtailsitter => "gz_quadtailsitter",
            Self::Tiltrotor => "gz_tiltrotor",
            Self::RoverDifferential => "gz_rover_differential",
            Self::RoverAckermann => "gz_rover_ackermann",
            Self::RoverMecanum => "gz_rover_mecanum",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        })
    }
}

/// Result of the telemetry configuration handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeOutcome {
    /// Primary command accepted and verified.
    Configured,
    /// Primary attempts exhausted, alternate command accepted.
    ConfiguredAlternate,
    /// Nothing worked; the instance runs unconfigured.
    Degraded,
}

/// Immutable status snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub variant: Variant,
    pub state: InstanceState,
    /// `None` while the instance holds no port lease.
    pub udp_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub handshake: Option<HandshakeOutcome>,
    pub configuration_degraded: bool,
}

impl InstanceStatus {
    pub fn ports(&self) -> Option<PortPair> {
        Some(PortPair::new(self.udp_port?, self.tcp_port?))
    }
}

/// Read-only view of the whole fleet.
#[derive(Debug, Clone, Serialize)]
pub struct FleetSnapshot {
    pub instances: Vec<InstanceStatus>,
    pub total: usize,
    pub running: usize,
}

// Per-entity presence fusion

mod machine;

pub use machine::{HeartbeatOutcome, MachineContext, PresenceMachine, TimeoutCheck};

#[cfg(test)]
mod tests;

use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum heartbeat timeout accepted for any entity
pub const MIN_TIMEOUT_SECONDS: u64 = 5;

/// Maximum heartbeat timeout accepted for any entity (one week)
pub const MAX_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Network-liveness signal derived from heartbeats
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkLiveness {
    Connected,
    Disconnected,
}

/// Geofence signal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeofenceState {
    Entered,
    Exited,
}

/// Fused presence, the only externally-visible presence attribute
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Present,
    NotPresent,
}

impl Presence {
    pub fn is_present(self) -> bool {
        self == Presence::Present
    }
}

/// Mutable per-entity state, guarded by the machine's mutex
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceState {
    pub network: NetworkLiveness,
    pub geofence: GeofenceState,
    pub presence: Presence,

    /// Epoch the timeout is armed against: the last accepted heartbeat or
    /// manual arrival; 0 = none since restart
    pub last_heartbeat_epoch: i64,

    /// Embedded timestamp of the last heartbeat the device itself sent;
    /// ordering and duplicate checks compare against this
    #[serde(default)]
    pub last_device_epoch: i64,

    /// Wall-clock time of the last presence change
    pub last_activity: Option<DateTime<Utc>>,

    /// Epoch at which the machine was created or restored; starts the grace period
    #[serde(skip)]
    pub tracking_since: i64,
}

impl PresenceState {
    /// A never-seen entity: away until the first heartbeat or manual arrival
    pub fn initial(now_epoch: i64) -> Self {
        Self {
            network: NetworkLiveness::Disconnected,
            geofence: GeofenceState::Exited,
            presence: Presence::NotPresent,
            last_heartbeat_epoch: 0,
            last_device_epoch: 0,
            last_activity: None,
            tracking_since: now_epoch,
        }
    }
}

/// Persisted form of one entity (`entity/{identity}` in the state store)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityRecord {
    pub identity: Identity,
    pub label: String,
    /// Per-entity override; `None` inherits the configured default
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    pub state: PresenceState,
}

/// Observable per-entity attributes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub identity: Identity,
    pub label: String,
    pub presence: Presence,
    pub network: NetworkLiveness,
    pub geofence: GeofenceState,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_heartbeat_epoch: i64,
    pub timeout_seconds: u64,
}

/// Receives presence changes from entity machines
///
/// Implemented by the household link; machines never hold the household
/// itself.
pub trait PresenceSink: Send + Sync {
    /// Called after `identity`'s fused presence changed
    fn presence_changed(&self, identity: &Identity, presence: Presence);

    /// True while the mirrored controller mode (current or pending) is away
    fn away_hint_active(&self) -> bool;
}

/// Derive fused presence from the current signals.
///
/// Re-derived on every transition, never patched incrementally. A
/// disconnected entity still inside the geofence keeps its previous value
/// unless the household has been told everyone left.
pub fn derive_presence(state: &PresenceState, away_hint: bool) -> Presence {
    match (state.network, state.geofence) {
        (NetworkLiveness::Connected, _) => Presence::Present,
        (NetworkLiveness::Disconnected, GeofenceState::Exited) => Presence::NotPresent,
        (NetworkLiveness::Disconnected, GeofenceState::Entered) if away_hint => {
            Presence::NotPresent
        }
        (NetworkLiveness::Disconnected, GeofenceState::Entered) => state.presence,
    }
}

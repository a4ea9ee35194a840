// Household aggregation engine

mod engine;

pub use engine::{Collaborators, Household, HouseholdError};


use crate::identity::Identity;
use crate::presence::{EntitySnapshot, Presence, PresenceSink};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Reduction over child presences
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// OR: present if any entity is present
    #[default]
    Anyone,
    /// AND: present only if every entity is present
    Everyone,
}

/// Security-mode controller modes
///
/// `Guest` is the controller's manual override; while it is in force the
/// household never pushes a mode of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Off,
    Home,
    Away,
    Night,
    Guest,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Off => "off",
            Mode::Home => "home",
            Mode::Away => "away",
            Mode::Night => "night",
            Mode::Guest => "guest",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Mode::Off),
            "home" => Ok(Mode::Home),
            "away" => Ok(Mode::Away),
            "night" => Ok(Mode::Night),
            "guest" => Ok(Mode::Guest),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// The household's small mutable cell: policy, override and mirror state
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeCell {
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub guest_override: bool,
    /// Last mode the controller confirmed or set
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Outgoing push in flight (not persisted)
    #[serde(skip)]
    pub pending: Option<Mode>,
}

impl ModeCell {
    /// "The household was told everyone left"
    pub fn away_hint(&self) -> bool {
        self.mode == Some(Mode::Away) || self.pending == Some(Mode::Away)
    }

    /// Automatic pushes are held back while a manual override is in force
    pub fn push_suppressed(&self) -> bool {
        self.guest_override || self.mode == Some(Mode::Guest) || self.pending == Some(Mode::Guest)
    }

    /// Decide whether `desired` should be pushed, marking it pending if so
    pub fn begin_push(&mut self, desired: Mode) -> Option<Mode> {
        if self.push_suppressed() {
            return None;
        }
        let effective = self.pending.or(self.mode);
        if effective == Some(desired) {
            return None;
        }
        // Home and asleep: leave night mode alone
        if desired == Mode::Home && effective == Some(Mode::Night) {
            return None;
        }
        self.pending = Some(desired);
        Some(desired)
    }

    /// Record the outcome of a push; superseded pushes are ignored
    pub fn finish_push(&mut self, mode: Mode, succeeded: bool) {
        if self.pending != Some(mode) {
            return;
        }
        self.pending = None;
        if succeeded {
            self.mode = Some(mode);
        }
    }
}

/// Observable household attributes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HouseholdSnapshot {
    pub presence: Presence,
    pub entity_count: usize,
    pub present_count: usize,
    pub policy: Policy,
    pub guest_override: bool,
    pub mirrored_mode: Option<Mode>,
    pub pending_mode: Option<Mode>,
}

/// Attribute publication, one per change (or per refresh)
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttributeUpdate {
    Entity(EntitySnapshot),
    Household(HouseholdSnapshot),
}

/// OR/AND reduction; returns (composite, present_count).
///
/// Zero entities reduce to not present; the guest override forces present.
pub fn aggregate(policy: Policy, guest_override: bool, presences: &[Presence]) -> (Presence, usize) {
    let present_count = presences.iter().filter(|p| p.is_present()).count();

    let reduced = match policy {
        _ if presences.is_empty() => false,
        Policy::Anyone => present_count > 0,
        Policy::Everyone => present_count == presences.len(),
    };

    let composite = if guest_override || reduced {
        Presence::Present
    } else {
        Presence::NotPresent
    };
    (composite, present_count)
}

/// Link handed to entity machines in place of the household itself
pub(crate) struct HouseholdLink {
    notify: mpsc::UnboundedSender<Identity>,
    cell: Arc<Mutex<ModeCell>>,
}

impl HouseholdLink {
    pub(crate) fn new(notify: mpsc::UnboundedSender<Identity>, cell: Arc<Mutex<ModeCell>>) -> Self {
        Self { notify, cell }
    }
}

impl PresenceSink for HouseholdLink {
    fn presence_changed(&self, identity: &Identity, _presence: Presence) {
        // Receiver gone only during shutdown
        let _ = self.notify.send(identity.clone());
    }

    fn away_hint_active(&self) -> bool {
        lock_cell(&self.cell).away_hint()
    }
}

pub(crate) fn lock_cell(cell: &Mutex<ModeCell>) -> MutexGuard<'_, ModeCell> {
    cell.lock().unwrap_or_else(|e| e.into_inner())
}

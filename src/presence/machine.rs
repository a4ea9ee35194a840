use super::{
    derive_presence, EntityRecord, EntitySnapshot, GeofenceState, NetworkLiveness, Presence,
    PresenceSink, PresenceState, MAX_TIMEOUT_SECONDS, MIN_TIMEOUT_SECONDS,
};
use crate::clock::Clock;
use crate::household::AttributeUpdate;
use crate::identity::Identity;
use crate::store::{entity_key, StateStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Collaborators shared by every machine in a household
#[derive(Clone)]
pub struct MachineContext {
    pub sink: Arc<dyn PresenceSink>,
    pub store: Arc<dyn StateStore>,
    pub clock: Arc<dyn Clock>,
    pub updates: broadcast::Sender<AttributeUpdate>,
    /// Heartbeats older than this (relative to receipt) are rejected
    pub freshness_window_seconds: i64,
}

/// Result of offering a heartbeat to a machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// Accepted; the caller must re-arm the timeout from now
    Accepted,
    /// Embedded timestamp older than the freshness window
    Stale { age_seconds: i64 },
    /// Embedded timestamp further ahead of receipt than the freshness window
    FutureDated { ahead_seconds: i64 },
    /// Embedded timestamp older than the last accepted heartbeat
    OutOfOrder { last_epoch: i64 },
    /// Same timestamp as the last accepted heartbeat
    Duplicate,
    /// Entity was removed; late delivery
    Revoked,
}

/// What the reconciliation sweep should do for one entity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutCheck {
    /// Not connected; nothing to watch
    Idle,
    /// Connected from restored state, no heartbeat yet since `since`
    AwaitingFirstHeartbeat { since: i64 },
    /// Connected with a known deadline
    Deadline { armed_epoch: i64, deadline: i64 },
}

/// Presence fusion state machine for one entity.
///
/// All inputs (heartbeat, expiry, geofence, manual command) serialize on one
/// mutex; no transition awaits while holding it.
pub struct PresenceMachine {
    identity: Identity,
    label: String,
    timeout_seconds: u64,
    inherits_timeout: bool,
    state: Mutex<PresenceState>,
    revoked: AtomicBool,
    ctx: MachineContext,
}

impl PresenceMachine {
    /// Create a machine for a newly provisioned entity
    pub fn new(
        identity: Identity,
        label: impl Into<String>,
        timeout_seconds: Option<u64>,
        default_timeout_seconds: u64,
        ctx: MachineContext,
    ) -> Self {
        let state = PresenceState::initial(ctx.clock.now_epoch());
        Self::with_state(identity, label.into(), timeout_seconds, default_timeout_seconds, state, ctx)
    }

    /// Rebuild a machine from its persisted record after a restart.
    ///
    /// The stored heartbeat epoch is discarded: until a genuine heartbeat
    /// arrives the sentinel suppresses timeout evaluation, and the grace
    /// period starts now.
    pub fn restore(record: EntityRecord, default_timeout_seconds: u64, ctx: MachineContext) -> Self {
        let mut state = record.state;
        state.last_heartbeat_epoch = 0;
        state.last_device_epoch = 0;
        state.tracking_since = ctx.clock.now_epoch();

        Self::with_state(
            record.identity,
            record.label,
            record.timeout_seconds,
            default_timeout_seconds,
            state,
            ctx,
        )
    }

    fn with_state(
        identity: Identity,
        label: String,
        timeout_seconds: Option<u64>,
        default_timeout_seconds: u64,
        state: PresenceState,
        ctx: MachineContext,
    ) -> Self {
        let effective = timeout_seconds
            .unwrap_or(default_timeout_seconds)
            .clamp(MIN_TIMEOUT_SECONDS, MAX_TIMEOUT_SECONDS);

        Self {
            identity,
            label,
            timeout_seconds: effective,
            inherits_timeout: timeout_seconds.is_none(),
            state: Mutex::new(state),
            revoked: AtomicBool::new(false),
            ctx,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    /// Current fused presence (one lock acquisition)
    pub fn presence(&self) -> Presence {
        self.lock().presence
    }

    pub fn state(&self) -> PresenceState {
        self.lock().clone()
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        let state = self.lock();
        self.snapshot_of(&state)
    }

    /// Persisted form of the current state
    pub fn record(&self) -> EntityRecord {
        let state = self.lock();
        self.record_of(&state)
    }

    /// Revoke the machine: late expiries, sweeps and heartbeats are ignored
    ///
    /// Taken under the state lock, so a transition either commits fully
    /// before revocation or observes it.
    pub fn revoke(&self) {
        let _state = self.lock();
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Rule 1: offer a heartbeat carrying `epoch`
    pub fn accept_heartbeat(&self, epoch: i64) -> HeartbeatOutcome {
        if self.is_revoked() {
            return HeartbeatOutcome::Revoked;
        }

        let now = self.ctx.clock.now_epoch();
        let age = now.saturating_sub(epoch);
        if age > self.ctx.freshness_window_seconds {
            debug!(identity = %self.identity, epoch, age, "Dropping stale heartbeat");
            return HeartbeatOutcome::Stale { age_seconds: age };
        }
        // Future-dated epochs never reach the ordering check
        let ahead = epoch.saturating_sub(now);
        if ahead > self.ctx.freshness_window_seconds {
            warn!(identity = %self.identity, epoch, ahead, "Dropping future-dated heartbeat");
            return HeartbeatOutcome::FutureDated {
                ahead_seconds: ahead,
            };
        }

        let away_hint = self.ctx.sink.away_hint_active();
        let mut state = self.lock();
        if self.is_revoked() {
            return HeartbeatOutcome::Revoked;
        }

        if epoch < state.last_device_epoch {
            debug!(
                identity = %self.identity,
                epoch,
                last_epoch = state.last_device_epoch,
                "Dropping out-of-order heartbeat"
            );
            return HeartbeatOutcome::OutOfOrder {
                last_epoch: state.last_device_epoch,
            };
        }
        if epoch == state.last_device_epoch {
            debug!(identity = %self.identity, epoch, "Dropping duplicate heartbeat");
            return HeartbeatOutcome::Duplicate;
        }

        let before = state.clone();
        state.last_device_epoch = epoch;
        state.last_heartbeat_epoch = epoch;
        state.network = NetworkLiveness::Connected;
        // Silent side effect: no separate geofence transition
        state.geofence = GeofenceState::Entered;
        self.commit(state, before, away_hint, "heartbeat");

        HeartbeatOutcome::Accepted
    }

    /// Rule 2: timeout expiry for a timer armed at `armed_epoch`.
    ///
    /// Ignored when a heartbeat was accepted after arming. Returns true if the
    /// entity transitioned to disconnected.
    pub fn expire(&self, armed_epoch: i64) -> bool {
        if self.is_revoked() {
            return false;
        }

        let away_hint = self.ctx.sink.away_hint_active();
        let mut state = self.lock();
        if self.is_revoked() {
            return false;
        }

        if state.last_heartbeat_epoch != armed_epoch {
            debug!(
                identity = %self.identity,
                armed_epoch,
                last_epoch = state.last_heartbeat_epoch,
                "Ignoring expiry superseded by a newer heartbeat"
            );
            return false;
        }
        if state.network == NetworkLiveness::Disconnected {
            return false;
        }

        info!(
            identity = %self.identity,
            timeout_seconds = self.timeout_seconds,
            "Heartbeat timeout expired"
        );

        let before = state.clone();
        state.network = NetworkLiveness::Disconnected;
        self.commit(state, before, away_hint, "timeout");
        true
    }

    /// Rule 3
    pub fn geofence_exit(&self) -> bool {
        self.transition("geofence_exit", |s| s.geofence = GeofenceState::Exited)
    }

    /// Rule 4
    pub fn geofence_enter(&self) -> bool {
        self.transition("geofence_enter", |s| s.geofence = GeofenceState::Entered)
    }

    /// Rule 5: manual "present".
    ///
    /// Counts as a synthetic heartbeat at the current time, so the caller
    /// re-arms the timeout from now. Returns the epoch to arm against. The
    /// device's own epoch is left alone, so a heartbeat it stamped before the
    /// command is still accepted.
    pub fn arrived(&self) -> Option<i64> {
        if self.is_revoked() {
            return None;
        }
        let now = self.ctx.clock.now_epoch();
        let away_hint = self.ctx.sink.away_hint_active();
        let mut state = self.lock();
        if self.is_revoked() {
            return None;
        }

        let before = state.clone();
        // A sender running slightly ahead keeps its later deadline
        let epoch = now.max(state.last_heartbeat_epoch);
        state.last_heartbeat_epoch = epoch;
        state.network = NetworkLiveness::Connected;
        state.geofence = GeofenceState::Entered;
        self.commit(state, before, away_hint, "manual_present");
        if self.is_revoked() {
            return None;
        }
        Some(epoch)
    }

    /// Rule 6: manual "not present"
    pub fn departed(&self) -> bool {
        self.transition("manual_not_present", |s| {
            s.network = NetworkLiveness::Disconnected;
            s.geofence = GeofenceState::Exited;
        })
    }

    /// Recompute without a raw event (the away hint changed)
    pub fn reevaluate(&self) -> bool {
        self.transition("reevaluate", |_| {})
    }

    /// Inspect timeout bookkeeping for the reconciliation sweep
    pub fn timeout_check(&self) -> TimeoutCheck {
        let state = self.lock();
        if state.network == NetworkLiveness::Disconnected {
            return TimeoutCheck::Idle;
        }
        if state.last_heartbeat_epoch == 0 {
            return TimeoutCheck::AwaitingFirstHeartbeat {
                since: state.tracking_since,
            };
        }
        TimeoutCheck::Deadline {
            armed_epoch: state.last_heartbeat_epoch,
            deadline: state
                .last_heartbeat_epoch
                .saturating_add(self.timeout_seconds as i64),
        }
    }

    /// Re-publish current attributes without changing state
    pub fn refresh(&self) {
        let snapshot = self.snapshot();
        let _ = self.ctx.updates.send(AttributeUpdate::Entity(snapshot));
    }

    /// Persist the current record (used right after provisioning)
    pub fn persist(&self) {
        let state = self.lock();
        if !self.is_revoked() {
            self.save(&state);
        }
    }

    fn transition<F>(&self, reason: &'static str, mutate: F) -> bool
    where
        F: FnOnce(&mut PresenceState),
    {
        if self.is_revoked() {
            return false;
        }
        let away_hint = self.ctx.sink.away_hint_active();
        let mut state = self.lock();
        let before = state.clone();
        mutate(&mut state);
        self.commit(state, before, away_hint, reason)
    }

    /// Recompute presence, then persist, publish and notify as needed.
    ///
    /// Returns true if fused presence changed.
    fn commit(
        &self,
        mut state: MutexGuard<'_, PresenceState>,
        before: PresenceState,
        away_hint: bool,
        reason: &'static str,
    ) -> bool {
        // Removed while this transition waited for the lock
        if self.is_revoked() {
            *state = before;
            return false;
        }

        let presence = derive_presence(&state, away_hint);
        let changed = presence != before.presence;
        if changed {
            state.presence = presence;
            state.last_activity = Some(Utc::now());
            info!(
                identity = %self.identity,
                label = %self.label,
                presence = ?presence,
                reason,
                "Presence changed"
            );
        }

        if *state == before {
            return false;
        }

        self.save(&state);
        let snapshot = self.snapshot_of(&state);
        drop(state);

        let _ = self.ctx.updates.send(AttributeUpdate::Entity(snapshot));
        if changed {
            self.ctx.sink.presence_changed(&self.identity, presence);
        }
        changed
    }

    fn save(&self, state: &PresenceState) {
        let record = self.record_of(state);
        let result = serde_json::to_value(&record)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.ctx.store.save(&entity_key(&self.identity), &value));
        if let Err(e) = result {
            warn!(identity = %self.identity, error = %e, "Failed to persist entity state");
        }
    }

    fn record_of(&self, state: &PresenceState) -> EntityRecord {
        EntityRecord {
            identity: self.identity.clone(),
            label: self.label.clone(),
            timeout_seconds: if self.inherits_timeout {
                None
            } else {
                Some(self.timeout_seconds)
            },
            state: state.clone(),
        }
    }

    fn snapshot_of(&self, state: &PresenceState) -> EntitySnapshot {
        EntitySnapshot {
            identity: self.identity.clone(),
            label: self.label.clone(),
            presence: state.presence,
            network: state.network,
            geofence: state.geofence,
            last_activity: state.last_activity,
            last_heartbeat_epoch: state.last_heartbeat_epoch,
            timeout_seconds: self.timeout_seconds,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PresenceState> {
        // Transitions never panic mid-update, so a poisoned state is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

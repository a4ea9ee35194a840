use super::*;
use crate::clock::{Clock, ManualClock};
use crate::household::AttributeUpdate;
use crate::store::{entity_key, MemoryStore, StateStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const NOW: i64 = 1_700_000_000;

#[derive(Default)]
struct RecordingSink {
    away: AtomicBool,
    changes: Mutex<Vec<(Identity, Presence)>>,
}

impl RecordingSink {
    fn changes(&self) -> Vec<(Identity, Presence)> {
        self.changes.lock().unwrap().clone()
    }
}

impl PresenceSink for RecordingSink {
    fn presence_changed(&self, identity: &Identity, presence: Presence) {
        self.changes.lock().unwrap().push((identity.clone(), presence));
    }

    fn away_hint_active(&self) -> bool {
        self.away.load(Ordering::SeqCst)
    }
}

struct Fixture {
    machine: PresenceMachine,
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    updates: broadcast::Receiver<AttributeUpdate>,
}

fn context(
    sink: Arc<RecordingSink>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
) -> (MachineContext, broadcast::Receiver<AttributeUpdate>) {
    let (updates, rx) = broadcast::channel(64);
    let ctx = MachineContext {
        sink,
        store,
        clock,
        updates,
        freshness_window_seconds: 30,
    };
    (ctx, rx)
}

fn fixture() -> Fixture {
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let (ctx, updates) = context(Arc::clone(&sink), Arc::clone(&clock), Arc::clone(&store));
    let identity = crate::identity::normalize("aa:bb:cc:dd:ee:ff").unwrap();
    let machine = PresenceMachine::new(identity, "alice", Some(60), 300, ctx);
    Fixture {
        machine,
        sink,
        clock,
        store,
        updates,
    }
}

#[test]
fn test_new_entity_starts_not_present() {
    let f = fixture();
    let state = f.machine.state();
    assert_eq!(state.network, NetworkLiveness::Disconnected);
    assert_eq!(state.geofence, GeofenceState::Exited);
    assert_eq!(state.presence, Presence::NotPresent);
    assert_eq!(state.last_heartbeat_epoch, 0);
    assert_eq!(f.machine.timeout_check(), TimeoutCheck::Idle);
}

#[test]
fn test_heartbeat_makes_present_and_enters_geofence() {
    let f = fixture();

    assert_eq!(f.machine.accept_heartbeat(NOW), HeartbeatOutcome::Accepted);

    let state = f.machine.state();
    assert_eq!(state.network, NetworkLiveness::Connected);
    assert_eq!(state.geofence, GeofenceState::Entered);
    assert_eq!(state.presence, Presence::Present);
    assert!(state.last_activity.is_some());
    assert_eq!(f.sink.changes().len(), 1);
}

#[test]
fn test_freshness_window_boundary() {
    let f = fixture();

    // 31 seconds old: rejected
    assert_eq!(
        f.machine.accept_heartbeat(NOW - 31),
        HeartbeatOutcome::Stale { age_seconds: 31 }
    );
    assert_eq!(f.machine.presence(), Presence::NotPresent);

    // 29 seconds old: accepted
    assert_eq!(f.machine.accept_heartbeat(NOW - 29), HeartbeatOutcome::Accepted);
    assert_eq!(f.machine.presence(), Presence::Present);
}

#[test]
fn test_out_of_order_and_duplicate_heartbeats_dropped() {
    let f = fixture();

    assert_eq!(f.machine.accept_heartbeat(NOW), HeartbeatOutcome::Accepted);
    assert_eq!(
        f.machine.accept_heartbeat(NOW - 5),
        HeartbeatOutcome::OutOfOrder { last_epoch: NOW }
    );
    assert_eq!(f.machine.accept_heartbeat(NOW), HeartbeatOutcome::Duplicate);
    assert_eq!(f.machine.state().last_heartbeat_epoch, NOW);
}

#[test]
fn test_future_dated_heartbeats_dropped() {
    let f = fixture();

    assert_eq!(
        f.machine.accept_heartbeat(NOW + 86_400),
        HeartbeatOutcome::FutureDated {
            ahead_seconds: 86_400
        }
    );
    assert_eq!(
        f.machine.accept_heartbeat(i64::MAX),
        HeartbeatOutcome::FutureDated {
            ahead_seconds: i64::MAX - NOW
        }
    );
    assert_eq!(
        f.machine.accept_heartbeat(i64::MIN),
        HeartbeatOutcome::Stale {
            age_seconds: i64::MAX
        }
    );
    assert_eq!(f.machine.state().last_heartbeat_epoch, 0);
    assert_eq!(f.machine.presence(), Presence::NotPresent);

    // Genuine heartbeats are not blocked by the rejected ones
    f.clock.advance(10);
    assert_eq!(f.machine.accept_heartbeat(NOW + 10), HeartbeatOutcome::Accepted);
    assert_eq!(f.machine.presence(), Presence::Present);

    // Slightly ahead, inside the window: accepted
    assert_eq!(f.machine.accept_heartbeat(NOW + 39), HeartbeatOutcome::Accepted);
    assert_eq!(
        f.machine.accept_heartbeat(NOW + 41),
        HeartbeatOutcome::FutureDated { ahead_seconds: 31 }
    );
}

#[test]
fn test_extreme_epochs_do_not_overflow() {
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let (mut ctx, _rx) = context(sink, clock, store);
    ctx.freshness_window_seconds = i64::MAX;
    let identity = crate::identity::normalize("aa:bb:cc:dd:ee:01").unwrap();
    let machine = PresenceMachine::new(identity, "wide", Some(60), 300, ctx);

    assert_eq!(machine.accept_heartbeat(i64::MAX), HeartbeatOutcome::Accepted);
    assert_eq!(
        machine.timeout_check(),
        TimeoutCheck::Deadline {
            armed_epoch: i64::MAX,
            deadline: i64::MAX
        }
    );
}

#[test]
fn test_heartbeat_stamped_before_manual_arrival_accepted() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);

    f.clock.advance(5);
    assert_eq!(f.machine.arrived(), Some(NOW + 5));

    // Sent before the command, delivered after it
    assert_eq!(f.machine.accept_heartbeat(NOW + 3), HeartbeatOutcome::Accepted);
    let state = f.machine.state();
    assert_eq!(state.last_device_epoch, NOW + 3);
    assert_eq!(state.last_heartbeat_epoch, NOW + 3);

    // The timer armed by the arrival is superseded
    assert!(!f.machine.expire(NOW + 5));
    assert!(f.machine.expire(NOW + 3));
}

#[test]
fn test_expiry_only_applies_to_current_heartbeat() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);
    f.clock.advance(10);
    f.machine.accept_heartbeat(NOW + 10);

    // Timer armed by the first heartbeat is superseded
    assert!(!f.machine.expire(NOW));
    assert_eq!(f.machine.state().network, NetworkLiveness::Connected);

    assert!(f.machine.expire(NOW + 10));
    assert_eq!(f.machine.state().network, NetworkLiveness::Disconnected);

    // Already disconnected
    assert!(!f.machine.expire(NOW + 10));
}

#[test]
fn test_disconnect_inside_geofence_holds_presence() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);

    f.machine.expire(NOW);

    let state = f.machine.state();
    assert_eq!(state.network, NetworkLiveness::Disconnected);
    assert_eq!(state.geofence, GeofenceState::Entered);
    assert_eq!(state.presence, Presence::Present);
}

#[test]
fn test_disconnect_with_away_hint_clears_presence() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);
    f.sink.away.store(true, Ordering::SeqCst);

    f.machine.expire(NOW);
    assert_eq!(f.machine.presence(), Presence::NotPresent);
}

#[test]
fn test_reevaluate_picks_up_away_hint() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);
    f.machine.expire(NOW);
    assert_eq!(f.machine.presence(), Presence::Present);

    f.sink.away.store(true, Ordering::SeqCst);
    assert!(f.machine.reevaluate());
    assert_eq!(f.machine.presence(), Presence::NotPresent);

    // Nothing left to change
    assert!(!f.machine.reevaluate());
}

#[test]
fn test_geofence_exit_while_connected_stays_present() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);

    f.machine.geofence_exit();
    assert_eq!(f.machine.presence(), Presence::Present);

    // Disconnect after exit: gone
    f.machine.expire(NOW);
    assert_eq!(f.machine.presence(), Presence::NotPresent);
}

#[test]
fn test_geofence_exit_while_disconnected_clears_presence() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);
    f.machine.expire(NOW);
    assert_eq!(f.machine.presence(), Presence::Present);

    assert!(f.machine.geofence_exit());
    assert_eq!(f.machine.presence(), Presence::NotPresent);

    // Entering again does not bring presence back without a heartbeat
    assert!(!f.machine.geofence_enter());
    assert_eq!(f.machine.presence(), Presence::NotPresent);
}

#[test]
fn test_manual_arrival_and_departure() {
    let f = fixture();

    assert_eq!(f.machine.arrived(), Some(NOW));
    assert_eq!(f.machine.presence(), Presence::Present);
    assert_eq!(
        f.machine.timeout_check(),
        TimeoutCheck::Deadline {
            armed_epoch: NOW,
            deadline: NOW + 60
        }
    );

    assert!(f.machine.departed());
    let state = f.machine.state();
    assert_eq!(state.network, NetworkLiveness::Disconnected);
    assert_eq!(state.geofence, GeofenceState::Exited);
    assert_eq!(state.presence, Presence::NotPresent);
}

#[test]
fn test_manual_arrival_never_moves_epoch_backwards() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW + 20);

    assert_eq!(f.machine.arrived(), Some(NOW + 20));
    assert_eq!(
        f.machine.accept_heartbeat(NOW + 10),
        HeartbeatOutcome::OutOfOrder { last_epoch: NOW + 20 }
    );
}

#[test]
fn test_revoked_machine_ignores_everything() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);
    f.machine.revoke();

    assert_eq!(f.machine.accept_heartbeat(NOW + 1), HeartbeatOutcome::Revoked);
    assert!(!f.machine.expire(NOW));
    assert!(!f.machine.departed());
    assert_eq!(f.machine.arrived(), None);
    assert_eq!(f.machine.presence(), Presence::Present);
}

#[test]
fn test_timeout_bounds() {
    let sink = Arc::new(RecordingSink::default());
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(MemoryStore::new());
    let (ctx, _rx) = context(sink, clock, store);
    let identity = crate::identity::normalize("aabbccddeeff").unwrap();

    let machine = PresenceMachine::new(identity.clone(), "tiny", Some(1), 300, ctx.clone());
    assert_eq!(machine.timeout_seconds(), MIN_TIMEOUT_SECONDS);

    let machine = PresenceMachine::new(identity, "huge", Some(u64::MAX), 300, ctx);
    assert_eq!(machine.timeout_seconds(), MAX_TIMEOUT_SECONDS);

    // Deadline stays after the heartbeat
    machine.accept_heartbeat(NOW);
    assert_eq!(
        machine.timeout_check(),
        TimeoutCheck::Deadline {
            armed_epoch: NOW,
            deadline: NOW + MAX_TIMEOUT_SECONDS as i64
        }
    );
}

#[test]
fn test_transitions_are_persisted() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);

    let stored = f.store.load(&entity_key(f.machine.identity())).unwrap().unwrap();
    let record: EntityRecord = serde_json::from_value(stored).unwrap();
    assert_eq!(record.label, "alice");
    assert_eq!(record.timeout_seconds, Some(60));
    assert_eq!(record.state.presence, Presence::Present);
    assert_eq!(record.state.last_heartbeat_epoch, NOW);
}

#[test]
fn test_updates_published_on_change_only() {
    let mut f = fixture();

    f.machine.accept_heartbeat(NOW);
    assert!(matches!(f.updates.try_recv(), Ok(AttributeUpdate::Entity(_))));

    // Dropped heartbeat: no publication
    f.machine.accept_heartbeat(NOW);
    assert!(f.updates.try_recv().is_err());

    f.machine.refresh();
    assert!(matches!(f.updates.try_recv(), Ok(AttributeUpdate::Entity(_))));
}

#[test]
fn test_restore_discards_stored_epoch() {
    let f = fixture();
    f.machine.accept_heartbeat(NOW);
    let record = f.machine.record();

    f.clock.advance(3600);
    let (ctx, _rx) = context(
        Arc::clone(&f.sink),
        Arc::clone(&f.clock),
        Arc::clone(&f.store),
    );
    let restored = PresenceMachine::restore(record, 300, ctx);

    let state = restored.state();
    assert_eq!(state.last_heartbeat_epoch, 0);
    assert_eq!(state.last_device_epoch, 0);
    assert_eq!(state.presence, Presence::Present);
    assert_eq!(
        restored.timeout_check(),
        TimeoutCheck::AwaitingFirstHeartbeat { since: NOW + 3600 }
    );

    // An old heartbeat still counts as fresh relative to receipt
    assert_eq!(restored.accept_heartbeat(NOW + 3590), HeartbeatOutcome::Accepted);
}

#[test]
fn test_presence_follows_rules_for_every_event_sequence() {
    #[derive(Clone, Copy, Debug)]
    enum Event {
        Heartbeat,
        Expire,
        Exit,
        Enter,
        Arrive,
        Depart,
        AwayOn,
        AwayOff,
    }
    const EVENTS: [Event; 8] = [
        Event::Heartbeat,
        Event::Expire,
        Event::Exit,
        Event::Enter,
        Event::Arrive,
        Event::Depart,
        Event::AwayOn,
        Event::AwayOff,
    ];

    // Every sequence of length 4
    for n in 0..EVENTS.len().pow(4) {
        let f = fixture();
        let mut idx = n;
        let mut trail = Vec::new();

        for _ in 0..4 {
            let event = EVENTS[idx % EVENTS.len()];
            idx /= EVENTS.len();
            trail.push(event);

            let before = f.machine.state();
            match event {
                Event::Heartbeat => {
                    f.clock.advance(1);
                    f.machine.accept_heartbeat(f.clock.now_epoch());
                }
                Event::Expire => {
                    f.machine.expire(before.last_heartbeat_epoch);
                }
                Event::Exit => {
                    f.machine.geofence_exit();
                }
                Event::Enter => {
                    f.machine.geofence_enter();
                }
                Event::Arrive => {
                    f.clock.advance(1);
                    f.machine.arrived();
                }
                Event::Depart => {
                    f.machine.departed();
                }
                Event::AwayOn => {
                    f.sink.away.store(true, Ordering::SeqCst);
                    f.machine.reevaluate();
                }
                Event::AwayOff => {
                    f.sink.away.store(false, Ordering::SeqCst);
                    f.machine.reevaluate();
                }
            }

            let after = f.machine.state();
            let away = f.sink.away.load(Ordering::SeqCst);
            match (after.network, after.geofence) {
                (NetworkLiveness::Connected, _) => {
                    assert_eq!(after.presence, Presence::Present, "{:?}", trail)
                }
                (NetworkLiveness::Disconnected, GeofenceState::Exited) => {
                    assert_eq!(after.presence, Presence::NotPresent, "{:?}", trail)
                }
                (NetworkLiveness::Disconnected, GeofenceState::Entered) if away => {
                    assert_eq!(after.presence, Presence::NotPresent, "{:?}", trail)
                }
                (NetworkLiveness::Disconnected, GeofenceState::Entered) => {
                    assert_eq!(after.presence, before.presence, "{:?}", trail)
                }
            }
            assert!(after.last_heartbeat_epoch >= before.last_heartbeat_epoch, "{:?}", trail);
        }

        // Notifications alternate and match the final presence
        let changes = f.sink.changes();
        for pair in changes.windows(2) {
            assert_ne!(pair[0].1, pair[1].1, "{:?}", trail);
        }
        if let Some((_, last)) = changes.last() {
            assert_eq!(*last, f.machine.presence(), "{:?}", trail);
        }
    }
}

/// Runs `hook` once, between a transition's revocation check and its lock
#[derive(Default)]
struct InterleavingSink {
    hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl PresenceSink for InterleavingSink {
    fn presence_changed(&self, _identity: &Identity, _presence: Presence) {}

    fn away_hint_active(&self) -> bool {
        if let Some(hook) = self.hook.lock().unwrap().take() {
            hook();
        }
        false
    }
}

fn interleaved_machine() -> (Arc<PresenceMachine>, Arc<InterleavingSink>, Arc<MemoryStore>) {
    let sink = Arc::new(InterleavingSink::default());
    let store = Arc::new(MemoryStore::new());
    let (updates, _) = broadcast::channel(16);
    let ctx = MachineContext {
        sink: sink.clone(),
        store: store.clone(),
        clock: Arc::new(ManualClock::new(NOW)),
        updates,
        freshness_window_seconds: 30,
    };
    let identity = crate::identity::normalize("aa:bb:cc:dd:ee:ff").unwrap();
    let machine = Arc::new(PresenceMachine::new(identity, "alice", None, 300, ctx));
    (machine, sink, store)
}

fn remove_during_next_transition(
    machine: &Arc<PresenceMachine>,
    sink: &InterleavingSink,
    store: &Arc<MemoryStore>,
) {
    let machine = Arc::clone(machine);
    let store = Arc::clone(store);
    *sink.hook.lock().unwrap() = Some(Box::new(move || {
        machine.revoke();
        store.delete(&entity_key(machine.identity())).unwrap();
    }));
}

#[test]
fn test_removal_during_transition_is_not_persisted() {
    let (machine, sink, store) = interleaved_machine();
    let key = entity_key(machine.identity());
    machine.accept_heartbeat(NOW);
    assert!(store.load(&key).unwrap().is_some());

    remove_during_next_transition(&machine, &sink, &store);
    assert!(!machine.departed());

    assert!(store.load(&key).unwrap().is_none());
    assert_eq!(machine.presence(), Presence::Present);
}

#[test]
fn test_removal_during_heartbeat_is_not_persisted() {
    let (machine, sink, store) = interleaved_machine();
    let key = entity_key(machine.identity());
    machine.persist();

    remove_during_next_transition(&machine, &sink, &store);
    assert_eq!(machine.accept_heartbeat(NOW), HeartbeatOutcome::Revoked);

    assert!(store.load(&key).unwrap().is_none());
    machine.persist();
    assert!(store.load(&key).unwrap().is_none());
    assert_eq!(machine.presence(), Presence::NotPresent);
}

use super::{
    aggregate, lock_cell, AttributeUpdate, HouseholdLink, HouseholdSnapshot, Mode, ModeCell,
    Policy,
};
use crate::clock::Clock;
use crate::config::PresenceConfig;
use crate::controller::ModeController;
use crate::identity::{self, Identity, IdentityError};
use crate::presence::{
    EntityRecord, EntitySnapshot, HeartbeatOutcome, MachineContext, Presence, PresenceMachine,
};
use crate::router::HeartbeatRouter;
use crate::scheduler::{Expiry, SweepReport, TimeoutScheduler};
use crate::store::{entity_key, StateStore, ENTITY_PREFIX, HOUSEHOLD_KEY};
use crate::transport::Subscriptions;
use anyhow::{Context, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Household command errors surfaced to operators
#[derive(Debug, Clone, PartialEq)]
pub enum HouseholdError {
    InvalidIdentity(IdentityError),
    UnknownEntity(String),
}

impl fmt::Display for HouseholdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HouseholdError::InvalidIdentity(e) => write!(f, "{}", e),
            HouseholdError::UnknownEntity(h) => write!(f, "no entity matches '{}'", h),
        }
    }
}

impl std::error::Error for HouseholdError {}

impl From<IdentityError> for HouseholdError {
    fn from(e: IdentityError) -> Self {
        HouseholdError::InvalidIdentity(e)
    }
}

/// External collaborators the engine calls into
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub clock: Arc<dyn Clock>,
    pub subscriptions: Arc<dyn Subscriptions>,
    /// `None` disables outgoing mode pushes
    pub controller: Option<Arc<dyn ModeController>>,
}

/// Receivers consumed by the background loops
struct LoopInputs {
    notify_rx: mpsc::UnboundedReceiver<Identity>,
    expiry_rx: mpsc::UnboundedReceiver<Expiry>,
}

/// Aggregation engine: entity registry, composite presence, guest override
/// and controller mirror.
pub struct Household {
    settings: PresenceConfig,
    router: HeartbeatRouter,

    /// identity -> machine; the only place machines are registered
    registry: DashMap<Identity, Arc<PresenceMachine>>,

    /// Shared with every machine's sink for the away hint
    cell: Arc<Mutex<ModeCell>>,

    scheduler: Arc<TimeoutScheduler>,
    machine_ctx: MachineContext,
    deps: Collaborators,

    /// Presence-change notifications (also used to request a recompute)
    notify_tx: mpsc::UnboundedSender<Identity>,

    /// Attribute broadcast for observers (API, logging)
    updates: broadcast::Sender<AttributeUpdate>,

    inputs: Mutex<Option<LoopInputs>>,
}

impl Household {
    /// Create an engine with no entities. Call [`Household::restore`] to
    /// reload persisted state and [`Household::start`] to run its loops.
    pub fn new(
        settings: PresenceConfig,
        policy: Policy,
        router: HeartbeatRouter,
        deps: Collaborators,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(1000);
        let (scheduler, expiry_rx) = TimeoutScheduler::new();

        let cell = Arc::new(Mutex::new(ModeCell {
            policy,
            ..ModeCell::default()
        }));

        let machine_ctx = MachineContext {
            sink: Arc::new(HouseholdLink::new(notify_tx.clone(), Arc::clone(&cell))),
            store: Arc::clone(&deps.store),
            clock: Arc::clone(&deps.clock),
            updates: updates.clone(),
            freshness_window_seconds: settings.freshness_window_seconds,
        };

        Arc::new(Self {
            settings,
            router,
            registry: DashMap::new(),
            cell,
            scheduler,
            machine_ctx,
            deps,
            notify_tx,
            updates,
            inputs: Mutex::new(Some(LoopInputs {
                notify_rx,
                expiry_rx,
            })),
        })
    }

    pub fn router(&self) -> &HeartbeatRouter {
        &self.router
    }

    pub fn scheduler(&self) -> &Arc<TimeoutScheduler> {
        &self.scheduler
    }

    /// Subscribe to attribute updates
    pub fn subscribe_updates(&self) -> broadcast::Receiver<AttributeUpdate> {
        self.updates.subscribe()
    }

    // ---- entity lifecycle -------------------------------------------------

    /// Attach an entity; returns the existing one if already attached.
    ///
    /// Rejects malformed identities synchronously.
    pub fn add_entity(
        &self,
        raw_identity: &str,
        label: &str,
        timeout_seconds: Option<u64>,
    ) -> Result<Arc<PresenceMachine>, IdentityError> {
        let identity = identity::normalize(raw_identity)?;

        let machine = match self.registry.entry(identity.clone()) {
            Entry::Occupied(existing) => {
                debug!(identity = %identity, "Entity already attached");
                return Ok(Arc::clone(existing.get()));
            }
            Entry::Vacant(slot) => {
                let machine = Arc::new(PresenceMachine::new(
                    identity.clone(),
                    label,
                    timeout_seconds,
                    self.settings.default_timeout_seconds,
                    self.machine_ctx.clone(),
                ));
                slot.insert(Arc::clone(&machine));
                machine
            }
        };

        self.deps.subscriptions.subscribe(&identity);
        machine.persist();
        machine.refresh();
        self.request_recompute(&identity);

        info!(
            identity = %identity,
            label = %label,
            timeout_seconds = machine.timeout_seconds(),
            "Entity added"
        );
        Ok(machine)
    }

    /// Detach by identity or label. Unknown handles are a warning, not an error.
    pub fn remove_entity(&self, handle: &str) -> Option<Arc<PresenceMachine>> {
        let identity = match self.find(handle) {
            Some(machine) => machine.identity().clone(),
            None => {
                warn!(handle = %handle, "Remove requested for unknown entity, ignoring");
                return None;
            }
        };

        let (_, machine) = match self.registry.remove(&identity) {
            Some(removed) => removed,
            None => {
                warn!(identity = %identity, "Entity already removed");
                return None;
            }
        };

        // Revoke first so an in-flight expiry or sweep cannot re-arm
        machine.revoke();
        self.scheduler.cancel(&identity);
        self.deps.subscriptions.unsubscribe(&identity);
        if let Err(e) = self.deps.store.delete(&entity_key(&identity)) {
            warn!(identity = %identity, error = %e, "Failed to delete persisted entity");
        }
        self.request_recompute(&identity);

        info!(identity = %identity, label = %machine.label(), "Entity removed");
        Some(machine)
    }

    /// Resolve an identity (any accepted spelling) or a label
    pub fn find(&self, handle: &str) -> Option<Arc<PresenceMachine>> {
        if let Ok(identity) = identity::normalize(handle) {
            if let Some(machine) = self.registry.get(&identity) {
                return Some(Arc::clone(machine.value()));
            }
        }
        self.registry
            .iter()
            .find(|entry| entry.value().label() == handle)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn get(&self, identity: &Identity) -> Option<Arc<PresenceMachine>> {
        self.registry.get(identity).map(|m| Arc::clone(m.value()))
    }

    /// Snapshots of all entities, sorted by label then identity
    pub fn entities(&self) -> Vec<EntitySnapshot> {
        let mut snapshots: Vec<EntitySnapshot> =
            self.machines().iter().map(|m| m.snapshot()).collect();
        snapshots.sort_by(|a, b| a.label.cmp(&b.label).then(a.identity.cmp(&b.identity)));
        snapshots
    }

    pub fn entity_count(&self) -> usize {
        self.registry.len()
    }

    fn machines(&self) -> Vec<Arc<PresenceMachine>> {
        self.registry.iter().map(|e| Arc::clone(e.value())).collect()
    }

    fn resolve(&self, handle: &str) -> Result<Arc<PresenceMachine>, HouseholdError> {
        self.find(handle)
            .ok_or_else(|| HouseholdError::UnknownEntity(handle.to_string()))
    }

    // ---- heartbeats and expiry ---------------------------------------------

    /// Decode and dispatch one transport message. Malformed input is dropped.
    pub fn route_message(&self, subject: &str, payload: &[u8]) -> Option<HeartbeatOutcome> {
        match self.router.parse(subject, payload) {
            Ok(heartbeat) => self.heartbeat(&heartbeat.identity, heartbeat.epoch),
            Err(e) => {
                warn!(subject = %subject, error = %e, "Dropping undeliverable heartbeat");
                None
            }
        }
    }

    /// Offer a heartbeat to `identity`'s machine and re-arm its timeout
    pub fn heartbeat(&self, identity: &Identity, epoch: i64) -> Option<HeartbeatOutcome> {
        let machine = match self.get(identity) {
            Some(m) => m,
            None => {
                debug!(identity = %identity, "Heartbeat for unattached identity");
                return None;
            }
        };

        let outcome = machine.accept_heartbeat(epoch);
        if outcome == HeartbeatOutcome::Accepted {
            self.arm(&machine, epoch);
        }
        Some(outcome)
    }

    fn arm(&self, machine: &PresenceMachine, epoch: i64) {
        let delay = Duration::from_secs(machine.timeout_seconds());
        self.scheduler.arm(machine.identity(), delay, epoch);
        if machine.is_revoked() {
            self.scheduler.cancel(machine.identity());
        }
    }

    /// Apply a fired timer
    pub fn on_expiry(&self, expiry: &Expiry) -> bool {
        match self.get(&expiry.identity) {
            Some(machine) => machine.expire(expiry.armed_epoch),
            None => false,
        }
    }

    /// Run one reconciliation sweep now
    pub fn reconcile(&self) -> SweepReport {
        let now = self.deps.clock.now_epoch();
        let report =
            self.scheduler
                .reconcile(self.machines(), now, self.settings.restart_grace_seconds);
        if report.expired > 0 || report.rearmed > 0 {
            info!(
                inspected = report.inspected,
                expired = report.expired,
                rearmed = report.rearmed,
                "Reconciliation sweep repaired timers"
            );
        }
        report
    }

    // ---- operator commands ---------------------------------------------------

    /// Manual "present"
    pub fn arrived(&self, handle: &str) -> Result<EntitySnapshot, HouseholdError> {
        let machine = self.resolve(handle)?;
        if let Some(epoch) = machine.arrived() {
            self.arm(&machine, epoch);
        }
        Ok(machine.snapshot())
    }

    /// Manual "not present"
    pub fn departed(&self, handle: &str) -> Result<EntitySnapshot, HouseholdError> {
        let machine = self.resolve(handle)?;
        machine.departed();
        self.scheduler.cancel(machine.identity());
        Ok(machine.snapshot())
    }

    pub fn geofence_enter(&self, handle: &str) -> Result<EntitySnapshot, HouseholdError> {
        let machine = self.resolve(handle)?;
        machine.geofence_enter();
        Ok(machine.snapshot())
    }

    pub fn geofence_exit(&self, handle: &str) -> Result<EntitySnapshot, HouseholdError> {
        let machine = self.resolve(handle)?;
        machine.geofence_exit();
        Ok(machine.snapshot())
    }

    /// Re-publish one entity's attributes
    pub fn refresh_entity(&self, handle: &str) -> Result<EntitySnapshot, HouseholdError> {
        let machine = self.resolve(handle)?;
        machine.refresh();
        Ok(machine.snapshot())
    }

    pub fn set_policy(&self, policy: Policy) -> HouseholdSnapshot {
        self.update_cell(|cell| cell.policy = policy);
        info!(policy = ?policy, "Policy set");
        self.recompute_aggregate()
    }

    /// Force (or release) composite presence
    pub fn set_guest_override(&self, enabled: bool) -> HouseholdSnapshot {
        self.update_cell(|cell| {
            cell.guest_override = enabled;
            if !enabled {
                // Clearing the override also releases a controller-side guest mode
                if cell.mode == Some(Mode::Guest) {
                    cell.mode = None;
                }
                if cell.pending == Some(Mode::Guest) {
                    cell.pending = None;
                }
            }
        });
        info!(enabled, "Guest override set");
        self.recompute_aggregate()
    }

    /// Incoming mode from the controller; authoritative
    pub fn set_mirrored_mode(&self, mode: Mode) -> HouseholdSnapshot {
        self.update_cell(|cell| {
            cell.mode = Some(mode);
            cell.pending = None;
            cell.guest_override = mode == Mode::Guest;
        });
        info!(mode = %mode, "Mirrored mode set");

        // The away hint may have flipped for disconnected-but-geofenced entities
        for machine in self.machines() {
            machine.reevaluate();
        }
        self.recompute_aggregate()
    }

    fn update_cell<F: FnOnce(&mut ModeCell)>(&self, mutate: F) {
        let cell = {
            let mut cell = lock_cell(&self.cell);
            mutate(&mut cell);
            cell.clone()
        };
        self.save_cell(&cell);
    }

    fn save_cell(&self, cell: &ModeCell) {
        let result = serde_json::to_value(cell)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.deps.store.save(HOUSEHOLD_KEY, &value));
        if let Err(e) = result {
            warn!(error = %e, "Failed to persist household state");
        }
    }

    // ---- aggregation ------------------------------------------------------

    /// Current composite without side effects
    pub fn snapshot(&self) -> HouseholdSnapshot {
        let presences: Vec<Presence> = self.machines().iter().map(|m| m.presence()).collect();
        let cell = lock_cell(&self.cell).clone();
        let (presence, present_count) = aggregate(cell.policy, cell.guest_override, &presences);

        HouseholdSnapshot {
            presence,
            entity_count: presences.len(),
            present_count,
            policy: cell.policy,
            guest_override: cell.guest_override,
            mirrored_mode: cell.mode,
            pending_mode: cell.pending,
        }
    }

    /// Recompute the composite, publish it and drive the controller mirror
    pub fn recompute_aggregate(&self) -> HouseholdSnapshot {
        let snapshot = self.snapshot();
        debug!(
            presence = ?snapshot.presence,
            present = snapshot.present_count,
            entities = snapshot.entity_count,
            "Aggregate recomputed"
        );

        let snapshot = match self.sync_mirror(snapshot.present_count) {
            Some(_) => self.snapshot(),
            None => snapshot,
        };

        let _ = self.updates.send(AttributeUpdate::Household(snapshot.clone()));
        snapshot
    }

    /// Re-publish every attribute without changing state
    pub fn refresh(&self) -> HouseholdSnapshot {
        for machine in self.machines() {
            machine.refresh();
        }
        let snapshot = self.snapshot();
        let _ = self.updates.send(AttributeUpdate::Household(snapshot.clone()));
        snapshot
    }

    /// Start an outgoing push if the mirror needs one
    fn sync_mirror(&self, present_count: usize) -> Option<JoinHandle<()>> {
        let controller = self.deps.controller.as_ref()?;
        let desired = if present_count > 0 { Mode::Home } else { Mode::Away };

        let mode = {
            let mut cell = lock_cell(&self.cell);
            if cell.push_suppressed() {
                debug!(desired = %desired, "Mode push suppressed by guest override");
                return None;
            }
            cell.begin_push(desired)?
        };

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(mode = %mode, error = %e, "No runtime for mode push");
                lock_cell(&self.cell).finish_push(mode, false);
                return None;
            }
        };

        info!(mode = %mode, "Pushing mode to controller");
        let controller = Arc::clone(controller);
        let cell = Arc::clone(&self.cell);
        let store = Arc::clone(&self.deps.store);
        Some(runtime.spawn(async move {
            let result = controller.set_mode(mode).await;
            let updated = {
                let mut cell = lock_cell(&cell);
                cell.finish_push(mode, result.is_ok());
                cell.clone()
            };
            match result {
                Ok(()) => {
                    info!(mode = %mode, "Controller accepted mode");
                    if let Err(e) = serde_json::to_value(&updated)
                        .map_err(anyhow::Error::from)
                        .and_then(|value| store.save(HOUSEHOLD_KEY, &value))
                    {
                        warn!(error = %e, "Failed to persist household state");
                    }
                }
                Err(e) => warn!(mode = %mode, error = %e, "Mode push failed; local state unchanged"),
            }
        }))
    }

    fn request_recompute(&self, identity: &Identity) {
        let _ = self.notify_tx.send(identity.clone());
    }

    // ---- persistence --------------------------------------------------------

    /// Reload the household cell and every persisted entity.
    ///
    /// Restored entities start with the "no heartbeat since restart"
    /// sentinel; the sweep gives them the full grace period.
    pub fn restore(&self) -> Result<usize> {
        if let Some(value) = self
            .deps
            .store
            .load(HOUSEHOLD_KEY)
            .context("Failed to load household state")?
        {
            match serde_json::from_value::<ModeCell>(value) {
                Ok(saved) => *lock_cell(&self.cell) = saved,
                Err(e) => warn!(error = %e, "Ignoring corrupt household state"),
            }
        }

        let keys = self
            .deps
            .store
            .keys(ENTITY_PREFIX)
            .context("Failed to list persisted entities")?;

        let mut restored = 0;
        for key in keys {
            let record = match self.deps.store.load(&key) {
                Ok(Some(value)) => match serde_json::from_value::<EntityRecord>(value) {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Skipping corrupt entity record");
                        continue;
                    }
                },
                Ok(None) => continue,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to load entity record");
                    continue;
                }
            };

            let identity = record.identity.clone();
            if self.registry.contains_key(&identity) {
                continue;
            }
            let machine = Arc::new(PresenceMachine::restore(
                record,
                self.settings.default_timeout_seconds,
                self.machine_ctx.clone(),
            ));
            self.registry.insert(identity.clone(), machine);
            self.deps.subscriptions.subscribe(&identity);
            restored += 1;
        }

        info!(entities = restored, "Restored household state");
        self.recompute_aggregate();
        Ok(restored)
    }

    // ---- background loops ---------------------------------------------------

    /// Spawn the expiry, recompute and sweep loops. Only the first call
    /// starts anything.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let inputs = match self.inputs.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(inputs) => inputs,
            None => {
                warn!("Household loops already started");
                return Vec::new();
            }
        };

        vec![
            tokio::spawn(Arc::clone(self).run_expiry_loop(inputs.expiry_rx)),
            tokio::spawn(Arc::clone(self).run_recompute_loop(inputs.notify_rx)),
            tokio::spawn(Arc::clone(self).run_sweep_loop()),
        ]
    }

    async fn run_expiry_loop(self: Arc<Self>, mut expiry_rx: mpsc::UnboundedReceiver<Expiry>) {
        while let Some(expiry) = expiry_rx.recv().await {
            self.on_expiry(&expiry);
        }
    }

    /// One recompute per burst of presence changes
    async fn run_recompute_loop(self: Arc<Self>, mut notify_rx: mpsc::UnboundedReceiver<Identity>) {
        let debounce = Duration::from_millis(self.settings.debounce_millis);

        while notify_rx.recv().await.is_some() {
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
            let mut coalesced = 1;
            while notify_rx.try_recv().is_ok() {
                coalesced += 1;
            }
            debug!(coalesced, "Recomputing aggregate");
            self.recompute_aggregate();
        }
    }

    async fn run_sweep_loop(self: Arc<Self>) {
        let period = Duration::from_secs(self.settings.sweep_interval_seconds.max(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await; // first tick is immediate

        loop {
            ticker.tick().await;
            self.reconcile();
        }
    }
}

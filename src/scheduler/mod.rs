//! Heartbeat timeout scheduling.
//!
//! Two tiers:
//! - a discrete one-shot tokio timer per entity (`arm`), the low-latency path;
//! - a periodic reconciliation sweep (`reconcile`) that recomputes every
//!   deadline from stored heartbeat epochs and repairs anything the timers
//!   missed (restart, runtime unavailable, dropped task).

use crate::identity::Identity;
use crate::presence::{PresenceMachine, TimeoutCheck};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};


/// A fired timer, delivered to the household's expiry loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expiry {
    pub identity: Identity,
    /// Heartbeat epoch the timer was armed against
    pub armed_epoch: i64,
}

/// Counters from one reconciliation sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub expired: usize,
    pub rearmed: usize,
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Per-entity one-shot expiry timers
pub struct TimeoutScheduler {
    pending: DashMap<Identity, PendingTimer>,
    next_generation: AtomicU64,
    expiry_tx: mpsc::UnboundedSender<Expiry>,
}

impl TimeoutScheduler {
    /// Create a scheduler and the receiving end of its expiry channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Expiry>) {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            pending: DashMap::new(),
            next_generation: AtomicU64::new(0),
            expiry_tx,
        });
        (scheduler, expiry_rx)
    }

    /// Schedule an expiry check `delay` from now, replacing any pending one.
    ///
    /// Fire-and-forget: returns false (and logs) when no runtime is available;
    /// the next sweep re-arms.
    pub fn arm(self: &Arc<Self>, identity: &Identity, delay: Duration, armed_epoch: i64) -> bool {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(identity = %identity, error = %e, "Cannot arm heartbeat timer, leaving it to the sweep");
                return false;
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;

        // Hold the slot while spawning so a zero-delay timer cannot fire
        // before its generation is recorded
        let slot = self.pending.entry(identity.clone());

        let scheduler: Weak<Self> = Arc::downgrade(self);
        let timer_identity = identity.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = scheduler.upgrade() {
                scheduler.fire(timer_identity, generation, armed_epoch);
            }
        });

        let timer = PendingTimer { generation, handle };
        match slot {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.insert(timer);
                previous.handle.abort();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(timer);
            }
        }

        debug!(
            identity = %identity,
            delay_secs = delay.as_secs(),
            armed_epoch,
            generation,
            "Armed heartbeat timer"
        );
        true
    }

    /// Drop any pending timer for `identity`; returns true if one existed
    pub fn cancel(&self, identity: &Identity) -> bool {
        match self.pending.remove(identity) {
            Some((_, timer)) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// True if a live timer is pending for `identity`
    pub fn is_pending(&self, identity: &Identity) -> bool {
        self.pending
            .get(identity)
            .map(|timer| !timer.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn fire(&self, identity: Identity, generation: u64, armed_epoch: i64) {
        // Only the most recently armed timer may report
        let current = self
            .pending
            .remove_if(&identity, |_, timer| timer.generation == generation);
        if current.is_none() {
            debug!(identity = %identity, generation, "Discarding superseded timer");
            return;
        }

        if self
            .expiry_tx
            .send(Expiry {
                identity,
                armed_epoch,
            })
            .is_err()
        {
            debug!("Expiry receiver dropped");
        }
    }

    /// Reconciliation sweep over `machines` at wall time `now`.
    ///
    /// - connected with no heartbeat since restart: disconnect once
    ///   `grace_seconds` have passed since the restore;
    /// - connected with a past deadline: expire immediately;
    /// - connected with a future deadline and no live timer: re-arm for the
    ///   remaining time.
    pub fn reconcile<I>(self: &Arc<Self>, machines: I, now: i64, grace_seconds: u64) -> SweepReport
    where
        I: IntoIterator<Item = Arc<PresenceMachine>>,
    {
        let mut report = SweepReport::default();

        for machine in machines {
            report.inspected += 1;
            let identity = machine.identity();

            if machine.is_revoked() {
                self.cancel(identity);
                continue;
            }

            match machine.timeout_check() {
                TimeoutCheck::Idle => {
                    self.cancel(identity);
                }
                TimeoutCheck::AwaitingFirstHeartbeat { since } => {
                    if now.saturating_sub(since) >= grace_seconds as i64 {
                        info!(
                            identity = %identity,
                            grace_seconds,
                            "No heartbeat since restart, disconnecting"
                        );
                        self.cancel(identity);
                        if machine.expire(0) {
                            report.expired += 1;
                        }
                    }
                }
                TimeoutCheck::Deadline {
                    armed_epoch,
                    deadline,
                } => {
                    let remaining = deadline.saturating_sub(now);
                    if remaining <= 0 {
                        self.cancel(identity);
                        if machine.expire(armed_epoch) {
                            debug!(identity = %identity, "Sweep caught a missed timeout");
                            report.expired += 1;
                        }
                    } else if !self.is_pending(identity) {
                        if self.arm(identity, Duration::from_secs(remaining as u64), armed_epoch) {
                            debug!(identity = %identity, remaining, "Sweep re-armed lost timer");
                            report.rearmed += 1;
                        }
                        // Removal may have raced the re-arm
                        if machine.is_revoked() {
                            self.cancel(identity);
                        }
                    }
                }
            }
        }

        report
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        for timer in self.pending.iter() {
            timer.handle.abort();
        }
    }
}

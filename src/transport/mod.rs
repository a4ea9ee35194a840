// Heartbeat transport (NATS core subscriptions)

mod client;

pub use client::{pump_inbound, InboundMessage, NatsConfig, NatsTransport};

use crate::identity::Identity;
use dashmap::DashMap;

/// Per-entity subscription management the household calls into
///
/// Both calls are fire-and-forget; delivery problems are tolerated by the
/// timeout path.
pub trait Subscriptions: Send + Sync {
    /// Start delivering heartbeats for `identity`
    fn subscribe(&self, identity: &Identity);

    /// Stop delivering heartbeats for `identity`
    fn unsubscribe(&self, identity: &Identity);
}

/// Records subscription calls without any broker (tests, offline runs)
#[derive(Default)]
pub struct LocalSubscriptions {
    active: DashMap<Identity, usize>,
}

impl LocalSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `identity` was subscribed while active
    pub fn subscribe_count(&self, identity: &Identity) -> usize {
        self.active.get(identity).map(|c| *c).unwrap_or(0)
    }

    pub fn is_subscribed(&self, identity: &Identity) -> bool {
        self.active.contains_key(identity)
    }
}

impl Subscriptions for LocalSubscriptions {
    fn subscribe(&self, identity: &Identity) {
        *self.active.entry(identity.clone()).or_insert(0) += 1;
    }

    fn unsubscribe(&self, identity: &Identity) {
        self.active.remove(identity);
    }
}

use super::Subscriptions;
use crate::household::Household;
use crate::identity::Identity;
use crate::router::HeartbeatRouter;
use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// NATS configuration
#[derive(Clone, Debug, Deserialize)]
pub struct NatsConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// First subject token of every heartbeat subject
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Inbound buffer between subscriber tasks and the router
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
}

fn default_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string())
}

fn default_subject_prefix() -> String {
    "presence".to_string()
}

fn default_inbound_capacity() -> usize {
    1024
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            subject_prefix: default_subject_prefix(),
            inbound_capacity: default_inbound_capacity(),
        }
    }
}

/// One delivered (subject, payload) pair
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// NATS-backed subscriptions: one forwarding task per subject
pub struct NatsTransport {
    client: async_nats::Client,
    router: HeartbeatRouter,
    inbound_tx: mpsc::Sender<InboundMessage>,
    tasks: DashMap<Identity, Vec<JoinHandle<()>>>,
}

impl NatsTransport {
    /// Connect to NATS; returns the transport and the inbound message stream
    pub async fn connect(
        config: &NatsConfig,
        router: HeartbeatRouter,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundMessage>)> {
        info!("Connecting to NATS at {}", config.url);

        let client = async_nats::connect(&config.url)
            .await
            .context("Failed to connect to NATS")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let transport = Arc::new(Self {
            client,
            router,
            inbound_tx,
            tasks: DashMap::new(),
        });
        Ok((transport, inbound_rx))
    }

    /// Get underlying NATS client
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }

    fn spawn_forwarder(&self, runtime: &Handle, identity: &Identity, subject: String) -> JoinHandle<()> {
        let client = self.client.clone();
        let tx = self.inbound_tx.clone();
        let identity = identity.clone();

        runtime.spawn(async move {
            let mut subscriber = match client.subscribe(subject.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    // Entity falls back to timeout-driven disconnection
                    error!(identity = %identity, subject = %subject, error = %e, "Failed to subscribe");
                    return;
                }
            };
            debug!(identity = %identity, subject = %subject, "Subscribed");

            while let Some(msg) = subscriber.next().await {
                let inbound = InboundMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload.to_vec(),
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
            // Dropping the subscriber unsubscribes from the server
            debug!(identity = %identity, subject = %subject, "Subscription ended");
        })
    }
}

impl Subscriptions for NatsTransport {
    fn subscribe(&self, identity: &Identity) {
        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(identity = %identity, error = %e, "No runtime, cannot subscribe");
                return;
            }
        };

        let handles: Vec<JoinHandle<()>> = self
            .router
            .subjects_for(identity)
            .into_iter()
            .map(|subject| self.spawn_forwarder(&runtime, identity, subject))
            .collect();

        if let Some(previous) = self.tasks.insert(identity.clone(), handles) {
            for handle in previous {
                handle.abort();
            }
        }
    }

    fn unsubscribe(&self, identity: &Identity) {
        if let Some((_, handles)) = self.tasks.remove(identity) {
            for handle in handles {
                handle.abort();
            }
            info!(identity = %identity, "Released heartbeat subscriptions");
        }
    }
}

/// Feed inbound messages to the household until the transport closes
pub async fn pump_inbound(mut inbound_rx: mpsc::Receiver<InboundMessage>, household: Arc<Household>) {
    info!("Heartbeat router running");
    while let Some(msg) = inbound_rx.recv().await {
        household.route_message(&msg.subject, &msg.payload);
    }
    warn!("Inbound heartbeat stream ended");
}

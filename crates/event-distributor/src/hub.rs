//! Process-local fan-out of live detection events. A single event loop
//! owns the subscriber map and drains the register/unregister/broadcast
//! channels; every subscriber owns a bounded send buffer, and a
//! subscriber that lets it fill is disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use telemetry::metrics::LIVE_SUBSCRIBERS;

/// Per-subscriber send buffer; backpressure beyond this disconnects.
pub const CLIENT_BUFFER: usize = 64;
const CONTROL_BUFFER: usize = 256;

pub struct BroadcastMessage {
    pub stream_id: Uuid,
    pub payload: String,
}

struct Registration {
    id: u64,
    filter: Option<Uuid>,
    tx: mpsc::Sender<String>,
}

pub struct Hub {
    clients: HashMap<u64, (Option<Uuid>, mpsc::Sender<String>)>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<u64>,
    broadcast_rx: mpsc::Receiver<BroadcastMessage>,
}

/// Cloneable front for the hub loop.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<u64>,
    broadcast_tx: mpsc::Sender<BroadcastMessage>,
    next_id: Arc<AtomicU64>,
}

pub fn hub() -> (Hub, HubHandle) {
    let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER);
    let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(CONTROL_BUFFER);
    (
        Hub {
            clients: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
        },
        HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        },
    )
}

impl Hub {
    /// The hub event loop. Biased so joins and leaves are applied before
    /// any broadcast queued behind them. Exits when every handle is gone.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                reg = self.register_rx.recv() => {
                    let Some(reg) = reg else { break };
                    debug!(client = reg.id, filter = ?reg.filter, "live subscriber joined");
                    self.clients.insert(reg.id, (reg.filter, reg.tx));
                    LIVE_SUBSCRIBERS.set(self.clients.len() as i64);
                }
                id = self.unregister_rx.recv() => {
                    let Some(id) = id else { break };
                    if self.clients.remove(&id).is_some() {
                        debug!(client = id, "live subscriber left");
                        LIVE_SUBSCRIBERS.set(self.clients.len() as i64);
                    }
                }
                msg = self.broadcast_rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.broadcast(msg);
                }
            }
        }
    }

    fn broadcast(&mut self, msg: BroadcastMessage) {
        let mut dropped = Vec::new();

        for (&id, (filter, tx)) in &self.clients {
            if let Some(filter) = filter {
                if *filter != msg.stream_id {
                    continue;
                }
            }
            match tx.try_send(msg.payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = id, "slow live subscriber, disconnecting");
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        // dropping the sender closes the subscriber's receive side
        for id in dropped {
            self.clients.remove(&id);
        }
        LIVE_SUBSCRIBERS.set(self.clients.len() as i64);
    }
}

impl HubHandle {
    /// Register a subscriber with an optional stream filter. The
    /// receiver closes when the hub disconnects the client (slow
    /// consumer) or shuts down.
    pub async fn join(&self, filter: Option<Uuid>) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let _ = self.register_tx.send(Registration { id, filter, tx }).await;
        (id, rx)
    }

    pub async fn leave(&self, id: u64) {
        let _ = self.unregister_tx.send(id).await;
    }

    pub async fn broadcast(&self, stream_id: Uuid, payload: String) {
        let _ = self
            .broadcast_tx
            .send(BroadcastMessage { stream_id, payload })
            .await;
    }
}

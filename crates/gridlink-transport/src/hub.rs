//! Connection hub: the authoritative registry of live connections.
//!
//! All registry mutation and fan-out runs on one dispatch task fed by three
//! channels (register, unregister, outbound). Senders never touch the map,
//! so there is no lock on the hot path; the task owns it outright.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use gridlink_protocol::Envelope;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Frame};

/// Predicate deciding whether a connection receives a broadcast.
pub type ConnectionFilter = Box<dyn Fn(&Connection) -> bool + Send + Sync>;

const CHANNEL_CAPACITY: usize = 1024;

enum Outbound {
    Broadcast {
        frame: Frame,
        exclude: Option<String>,
        filter: Option<ConnectionFilter>,
    },
    Direct {
        connection_id: String,
        frame: Frame,
    },
}

/// The dispatch loop state. Constructed and consumed by [`Hub::spawn`].
pub struct Hub {
    connections: HashMap<String, Arc<Connection>>,
    register_rx: mpsc::Receiver<Arc<Connection>>,
    unregister_rx: mpsc::Receiver<String>,
    outbound_rx: mpsc::Receiver<Outbound>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

/// Cheap, cloneable front door to the hub's dispatch loop.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Arc<Connection>>,
    unregister_tx: mpsc::Sender<String>,
    outbound_tx: mpsc::Sender<Outbound>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Hub {
    /// Start the dispatch loop. It runs until `shutdown` is cancelled.
    pub fn spawn(shutdown: CancellationToken) -> (HubHandle, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let active = Arc::new(AtomicUsize::new(0));

        let hub = Hub {
            connections: HashMap::new(),
            register_rx,
            unregister_rx,
            outbound_rx,
            active: active.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            outbound_tx,
            active,
            shutdown,
        };
        (handle, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        info!("hub dispatch loop started");
        loop {
            // Registry changes are drained before fan-out so a sender that
            // registered and then broadcast sees its own registration applied.
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(conn) = self.register_rx.recv() => self.register(conn),
                Some(id) = self.unregister_rx.recv() => self.unregister(&id, "unregistered"),
                Some(out) = self.outbound_rx.recv() => self.dispatch(out),
                else => break,
            }
        }

        for conn in self.connections.values() {
            conn.cancel();
        }
        self.connections.clear();
        self.active.store(0, Ordering::Relaxed);
        info!("hub dispatch loop stopped");
    }

    fn register(&mut self, conn: Arc<Connection>) {
        debug!(conn_id = %conn.id, "connection registered");
        if let Some(previous) = self.connections.insert(conn.id.clone(), conn) {
            previous.cancel();
        }
        self.active.store(self.connections.len(), Ordering::Relaxed);
    }

    fn unregister(&mut self, id: &str, reason: &str) {
        if let Some(conn) = self.connections.remove(id) {
            conn.cancel();
            debug!(conn_id = %id, reason, "connection removed from hub");
        }
        self.active.store(self.connections.len(), Ordering::Relaxed);
    }

    fn dispatch(&mut self, out: Outbound) {
        match out {
            Outbound::Broadcast {
                frame,
                exclude,
                filter,
            } => {
                let mut dead = Vec::new();
                let mut recipients = 0usize;
                for (id, conn) in &self.connections {
                    if exclude.as_deref() == Some(id.as_str()) || !conn.is_authenticated() {
                        continue;
                    }
                    if let Some(filter) = &filter {
                        if !filter(conn) {
                            continue;
                        }
                    }
                    recipients += 1;
                    if !conn.enqueue_frame(frame.clone()) {
                        dead.push(id.clone());
                    }
                }
                debug!(recipients, dropped = dead.len(), "broadcast dispatched");
                for id in dead {
                    warn!(conn_id = %id, "dropping slow consumer");
                    self.unregister(&id, "outbound queue full");
                }
            }
            Outbound::Direct {
                connection_id,
                frame,
            } => {
                let Some(conn) = self.connections.get(&connection_id) else {
                    debug!(conn_id = %connection_id, "send to unknown connection ignored");
                    return;
                };
                if !conn.enqueue_frame(frame) {
                    warn!(conn_id = %connection_id, "dropping slow consumer");
                    self.unregister(&connection_id, "outbound queue full");
                }
            }
        }
    }
}

impl HubHandle {
    pub async fn register(&self, conn: Arc<Connection>) {
        if self.register_tx.send(conn).await.is_err() {
            debug!("hub stopped; registration ignored");
        }
    }

    pub async fn unregister(&self, connection_id: &str) {
        if self.unregister_tx.send(connection_id.to_string()).await.is_err() {
            debug!("hub stopped; unregistration ignored");
        }
    }

    /// Fan an envelope out to every authenticated connection except
    /// `exclude`, optionally narrowed by `filter`.
    pub async fn broadcast(
        &self,
        envelope: &Envelope,
        exclude: Option<&str>,
        filter: Option<ConnectionFilter>,
    ) {
        let Some(frame) = encode(envelope) else { return };
        let out = Outbound::Broadcast {
            frame,
            exclude: exclude.map(str::to_string),
            filter,
        };
        if self.outbound_tx.send(out).await.is_err() {
            debug!("hub stopped; broadcast dropped");
        }
    }

    /// Fire-and-forget push to one connection. An unknown id is ignored.
    pub async fn send_to(&self, connection_id: &str, envelope: &Envelope) {
        let Some(frame) = encode(envelope) else { return };
        let out = Outbound::Direct {
            connection_id: connection_id.to_string(),
            frame,
        };
        if self.outbound_tx.send(out).await.is_err() {
            debug!("hub stopped; direct send dropped");
        }
    }

    /// Number of registered connections as of the last registry change.
    pub fn connection_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.outbound_tx.is_closed()
    }

    /// Stop the dispatch loop; every registered connection is cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(error = %e, "failed to serialize envelope for hub");
            None
        }
    }
}

// src/core/cluster/memory.rs

//! An in-process mesh: every node lives in the same process and messages
//! are delivered over channels.
//!
//! The mesh honors the transport contract the scope actors are written
//! against: per-pair FIFO order, best-effort casts (dropped with a warning
//! when a mailbox is full), synchronous calls that fail when the target
//! endpoint is gone, and monitors that fire on endpoint removal, node
//! departure, or partition. `partition`/`heal` make the split-brain
//! scenarios reproducible in a single process.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::core::cluster::bus::{
    ActorRegistration, ClusterBus, Inbound, MemberEvent, NodeLink, PeerMonitor,
};
use crate::core::cluster::messages::{Envelope, NodeId, RequestOutcome, ScopeRequest};
use crate::core::errors::RosterError;
use async_trait::async_trait;

const MEMBER_EVENT_CAPACITY: usize = 256;

struct MeshNode {
    actors: DashMap<String, mpsc::Sender<Inbound>>,
    members_tx: broadcast::Sender<MemberEvent>,
}

struct MonitorEntry {
    id: u64,
    watcher: NodeId,
    target_node: NodeId,
    target_actor: String,
    mailbox: mpsc::Sender<Inbound>,
}

struct BusInner {
    nodes: DashMap<NodeId, Arc<MeshNode>>,
    monitors: Mutex<Vec<MonitorEntry>>,
    blocked: Mutex<HashSet<(NodeId, NodeId)>>,
    next_monitor: AtomicU64,
}

impl BusInner {
    fn is_blocked(&self, a: &NodeId, b: &NodeId) -> bool {
        self.blocked.lock().contains(&(a.clone(), b.clone()))
    }

    fn fire_peer_down(entry: &MonitorEntry) {
        let notice = Inbound::PeerDown {
            node: entry.target_node.clone(),
        };
        if entry.mailbox.try_send(notice).is_err() {
            warn!(
                watcher = %entry.watcher,
                target = %entry.target_node,
                actor = %entry.target_actor,
                "dropping peer-down notice: watcher mailbox unavailable"
            );
        }
    }

    /// Fires and removes every monitor matching `pred`.
    fn fire_monitors(&self, pred: impl Fn(&MonitorEntry) -> bool) {
        let mut monitors = self.monitors.lock();
        monitors.retain(|entry| {
            if pred(entry) {
                Self::fire_peer_down(entry);
                false
            } else {
                true
            }
        });
    }

    fn notify_members(&self, node: &NodeId, event: MemberEvent) {
        if let Some(mesh_node) = self.nodes.get(node) {
            let _ = mesh_node.members_tx.send(event);
        }
    }
}

/// The in-process mesh. Clone-cheap via [`ClusterBus::attach`] links.
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                nodes: DashMap::new(),
                monitors: Mutex::new(Vec::new()),
                blocked: Mutex::new(HashSet::new()),
                next_monitor: AtomicU64::new(1),
            }),
        }
    }

    /// Severs the pair `(a, b)`: delivery is dropped in both directions,
    /// both sides observe the other as down, and monitors across the cut
    /// fire, matching what a dist disconnect looks like.
    pub fn partition(&self, a: &NodeId, b: &NodeId) {
        {
            let mut blocked = self.inner.blocked.lock();
            blocked.insert((a.clone(), b.clone()));
            blocked.insert((b.clone(), a.clone()));
        }
        self.inner.notify_members(a, MemberEvent::Down(b.clone()));
        self.inner.notify_members(b, MemberEvent::Down(a.clone()));
        self.inner.fire_monitors(|m| {
            (m.watcher == *a && m.target_node == *b) || (m.watcher == *b && m.target_node == *a)
        });
    }

    /// Restores the pair `(a, b)`; both sides observe the other as up and
    /// re-run discovery.
    pub fn heal(&self, a: &NodeId, b: &NodeId) {
        {
            let mut blocked = self.inner.blocked.lock();
            blocked.remove(&(a.clone(), b.clone()));
            blocked.remove(&(b.clone(), a.clone()));
        }
        if self.inner.nodes.contains_key(a) && self.inner.nodes.contains_key(b) {
            self.inner.notify_members(a, MemberEvent::Up(b.clone()));
            self.inner.notify_members(b, MemberEvent::Up(a.clone()));
        }
    }

    /// Removes a node from the mesh entirely, as a hard crash would.
    pub fn detach(&self, node: &NodeId) {
        if self.inner.nodes.remove(node).is_none() {
            return;
        }
        for entry in self.inner.nodes.iter() {
            if !self.inner.is_blocked(entry.key(), node) {
                let _ = entry.value().members_tx.send(MemberEvent::Down(node.clone()));
            }
        }
        self.inner
            .fire_monitors(|m| m.target_node == *node || m.watcher == *node);
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterBus for MemoryBus {
    fn attach(&self, node: NodeId) -> Arc<dyn NodeLink> {
        let (members_tx, _) = broadcast::channel(MEMBER_EVENT_CAPACITY);
        let mesh_node = Arc::new(MeshNode {
            actors: DashMap::new(),
            members_tx,
        });
        self.inner.nodes.insert(node.clone(), mesh_node);
        for entry in self.inner.nodes.iter() {
            if entry.key() != &node && !self.inner.is_blocked(entry.key(), &node) {
                let _ = entry.value().members_tx.send(MemberEvent::Up(node.clone()));
            }
        }
        Arc::new(MemoryLink {
            bus: self.inner.clone(),
            node,
        })
    }
}

struct MemoryLink {
    bus: Arc<BusInner>,
    node: NodeId,
}

#[async_trait]
impl NodeLink for MemoryLink {
    fn node(&self) -> &NodeId {
        &self.node
    }

    fn members(&self) -> Vec<NodeId> {
        self.bus
            .nodes
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|n| *n != self.node && !self.bus.is_blocked(&self.node, n))
            .collect()
    }

    fn subscribe_members(&self) -> broadcast::Receiver<MemberEvent> {
        match self.bus.nodes.get(&self.node) {
            Some(mesh_node) => mesh_node.members_tx.subscribe(),
            // Detached node: hand back a receiver that never fires.
            None => broadcast::channel(1).0.subscribe(),
        }
    }

    fn register_actor(&self, actor: &str, mailbox: mpsc::Sender<Inbound>) -> ActorRegistration {
        if let Some(mesh_node) = self.bus.nodes.get(&self.node) {
            mesh_node.actors.insert(actor.to_string(), mailbox);
        }
        let bus = self.bus.clone();
        let node = self.node.clone();
        let actor = actor.to_string();
        ActorRegistration::new(move || {
            if let Some(mesh_node) = bus.nodes.get(&node) {
                mesh_node.actors.remove(&actor);
            }
            bus.fire_monitors(|m| m.target_node == node && m.target_actor == actor);
        })
    }

    fn send(&self, node: &NodeId, actor: &str, envelope: Envelope) {
        if self.bus.is_blocked(&self.node, node) {
            debug!(from = %self.node, to = %node, "dropping cast across partition");
            return;
        }
        let Some(mesh_node) = self.bus.nodes.get(node) else {
            debug!(from = %self.node, to = %node, "dropping cast to unknown node");
            return;
        };
        let Some(mailbox) = mesh_node.actors.get(actor) else {
            debug!(from = %self.node, to = %node, actor, "dropping cast to unknown actor");
            return;
        };
        if let Err(e) = mailbox.try_send(Inbound::Peer(envelope)) {
            warn!(from = %self.node, to = %node, actor, "dropping cast: {e}");
        }
    }

    async fn call(
        &self,
        node: &NodeId,
        actor: &str,
        req: ScopeRequest,
    ) -> Result<RequestOutcome, RosterError> {
        if self.bus.is_blocked(&self.node, node) {
            return Err(RosterError::Transport(format!(
                "node '{node}' is unreachable"
            )));
        }
        let mailbox = {
            let mesh_node = self
                .bus
                .nodes
                .get(node)
                .ok_or_else(|| RosterError::Transport(format!("unknown node '{node}'")))?;
            let mailbox = mesh_node.actors.get(actor).ok_or_else(|| {
                RosterError::Transport(format!("no actor '{actor}' on node '{node}'"))
            })?;
            mailbox.value().clone()
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        mailbox
            .send(Inbound::Request {
                req,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RosterError::Transport(format!("actor '{actor}' on '{node}' is gone")))?;
        reply_rx.await.map_err(|_| {
            RosterError::Transport(format!("actor '{actor}' on '{node}' dropped the call"))
        })
    }

    fn monitor_actor(
        &self,
        node: &NodeId,
        actor: &str,
        mailbox: mpsc::Sender<Inbound>,
    ) -> PeerMonitor {
        let id = self.bus.next_monitor.fetch_add(1, Ordering::Relaxed);
        let entry = MonitorEntry {
            id,
            watcher: self.node.clone(),
            target_node: node.clone(),
            target_actor: actor.to_string(),
            mailbox,
        };

        let target_alive = !self.bus.is_blocked(&self.node, node)
            && self
                .bus
                .nodes
                .get(node)
                .is_some_and(|mesh_node| mesh_node.actors.contains_key(actor));
        if target_alive {
            self.bus.monitors.lock().push(entry);
        } else {
            BusInner::fire_peer_down(&entry);
        }

        let bus = self.bus.clone();
        PeerMonitor::new(move || {
            bus.monitors.lock().retain(|m| m.id != id);
        })
    }
}

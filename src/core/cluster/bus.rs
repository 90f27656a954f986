// src/core/cluster/bus.rs

//! The transport seam between scope actors and whatever carries their
//! messages between nodes.
//!
//! Roster assumes a location-transparent mesh with per-pair FIFO,
//! best-effort delivery: fire-and-forget casts may be dropped, synchronous
//! calls surface a transport failure when the remote endpoint is gone, and
//! monitoring a remote actor is a subscription that fires when that
//! endpoint disappears (actor stop, node departure, or partition).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::core::cluster::messages::{Envelope, NodeId, RequestOutcome, ScopeRequest};
use crate::core::errors::RosterError;

/// Cluster membership events, delivered per attached node's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    Up(NodeId),
    Down(NodeId),
}

/// What the transport delivers into a scope actor's mailbox.
#[derive(Debug)]
pub enum Inbound {
    /// A peer cast (DISCOVER / ACK_SYNC / SYNC_*).
    Peer(Envelope),
    /// A synchronous request, local or remote, with its reply channel.
    Request {
        req: ScopeRequest,
        reply: oneshot::Sender<RequestOutcome>,
    },
    /// A monitored peer actor went down.
    PeerDown { node: NodeId },
}

/// Drop-guard for a registered actor endpoint. Dropping it removes the
/// endpoint and fires every monitor watching it.
pub struct ActorRegistration {
    unregister: Option<Box<dyn FnOnce() + Send>>,
}

impl ActorRegistration {
    pub fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unregister: Some(Box::new(unregister)),
        }
    }
}

impl Drop for ActorRegistration {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            unregister();
        }
    }
}

/// Drop-guard for a monitor on a remote actor.
pub struct PeerMonitor {
    demonitor: Option<Box<dyn FnOnce() + Send>>,
}

impl PeerMonitor {
    pub fn new(demonitor: impl FnOnce() + Send + 'static) -> Self {
        Self {
            demonitor: Some(Box::new(demonitor)),
        }
    }
}

impl Drop for PeerMonitor {
    fn drop(&mut self) {
        if let Some(demonitor) = self.demonitor.take() {
            demonitor();
        }
    }
}

/// A mesh a node can attach to.
pub trait ClusterBus: Send + Sync + 'static {
    /// Joins `node` to the mesh and returns its link. Attachment announces
    /// the node to every member that can currently see it.
    fn attach(&self, node: NodeId) -> Arc<dyn NodeLink>;
}

/// One node's view of the mesh.
#[async_trait]
pub trait NodeLink: Send + Sync + 'static {
    /// The node this link belongs to.
    fn node(&self) -> &NodeId;

    /// The other nodes currently visible from this node.
    fn members(&self) -> Vec<NodeId>;

    /// Subscribes to node-up / node-down events as seen from this node.
    fn subscribe_members(&self) -> broadcast::Receiver<MemberEvent>;

    /// Registers a named actor endpoint on this node.
    fn register_actor(
        &self,
        actor: &str,
        mailbox: mpsc::Sender<Inbound>,
    ) -> ActorRegistration;

    /// Fire-and-forget send to `(node, actor)`. No acknowledgement, no
    /// retry; undeliverable messages are dropped.
    fn send(&self, node: &NodeId, actor: &str, envelope: Envelope);

    /// Synchronous request to `(node, actor)`. Blocks until the remote actor
    /// replies; a vanished endpoint surfaces as `RosterError::Transport`.
    async fn call(
        &self,
        node: &NodeId,
        actor: &str,
        req: ScopeRequest,
    ) -> Result<RequestOutcome, RosterError>;

    /// Monitors the remote actor `(node, actor)`; an `Inbound::PeerDown` is
    /// delivered to `mailbox` when it goes away. Fires immediately if the
    /// endpoint is already gone.
    fn monitor_actor(
        &self,
        node: &NodeId,
        actor: &str,
        mailbox: mpsc::Sender<Inbound>,
    ) -> PeerMonitor;
}

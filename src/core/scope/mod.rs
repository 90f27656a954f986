// src/core/scope/mod.rs

//! The per-scope actor: mesh discovery, peer tracking, anti-entropy
//! snapshot exchange, sync broadcast, and liveness-event routing.
//!
//! One actor runs per (scope, state-machine kind) per node. The actor is
//! the single writer of its scope's tables; everything it does happens
//! between messages of its mailbox. The specific replication semantics live
//! behind [`ScopeMachine`], which the registry and groups machines
//! implement; machines emit broadcasts into an [`Outbox`] the actor drains
//! after every step, so they stay unit-testable without a transport.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::core::cluster::bus::{Inbound, MemberEvent, NodeLink};
use crate::core::cluster::messages::{
    ActorRef, Envelope, NodeId, PROTOCOL_VERSION, RequestOutcome, ScopeMessage, ScopeRequest,
    SnapshotRow, SyncEvent,
};
use crate::core::process::DownNotice;

/// Sync broadcasts a machine wants sent to the scope's peers, optionally
/// excluding the requester node of the operation that produced them.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<(SyncEvent, Option<NodeId>)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn broadcast(&mut self, event: SyncEvent) {
        self.items.push((event, None));
    }

    pub fn broadcast_excluding(&mut self, event: SyncEvent, exclude: NodeId) {
        self.items.push((event, Some(exclude)));
    }

    pub fn drain(&mut self) -> Vec<(SyncEvent, Option<NodeId>)> {
        std::mem::take(&mut self.items)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A per-scope replicated state machine, driven by its scope actor.
pub trait ScopeMachine: Send + 'static {
    /// The actor-name prefix of this machine kind; the scope actor for
    /// scope `s1` of a machine with kind `registry` is named `registry_s1`
    /// on every node.
    const KIND: &'static str;

    /// All rows owned by the local node, projected for an ACK_SYNC.
    fn local_snapshot(&self) -> Vec<SnapshotRow>;

    /// Replays a peer's snapshot; each row is treated as a received
    /// sync-register/sync-join.
    fn apply_snapshot(&mut self, rows: Vec<SnapshotRow>, out: &mut Outbox);

    /// Applies a broadcast replication event from a peer.
    fn apply_sync(&mut self, event: SyncEvent, out: &mut Outbox);

    /// Executes an owner-side operation (register/unregister/join/leave).
    fn handle_request(&mut self, req: ScopeRequest, out: &mut Outbox) -> RequestOutcome;

    /// A locally-monitored process died.
    fn handle_down(&mut self, notice: DownNotice, out: &mut Outbox);

    /// A peer scope actor died; evict everything its node owned.
    fn purge_node(&mut self, node: &NodeId);

    /// Re-establishes monitors over a pre-existing table on actor start,
    /// dropping rows of local pids that died in between.
    fn rebuild_monitors(&mut self);
}

struct Peer {
    actor: ActorRef,
    _monitor: crate::core::cluster::bus::PeerMonitor,
}

/// The generic scope actor event loop.
pub struct ScopeActor<M: ScopeMachine> {
    scope: String,
    actor_name: String,
    link: Arc<dyn NodeLink>,
    machine: M,
    peers: HashMap<NodeId, Peer>,
    mailbox_tx: mpsc::Sender<Inbound>,
    mailbox_rx: mpsc::Receiver<Inbound>,
    down_rx: mpsc::UnboundedReceiver<DownNotice>,
    shutdown_rx: broadcast::Receiver<()>,
}

/// The process name of the scope actor for `(kind, scope)`, identical on
/// every node so peers can address it location-transparently.
pub fn actor_name(kind: &str, scope: &str) -> String {
    format!("{kind}_{scope}")
}

impl<M: ScopeMachine> ScopeActor<M> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scope: String,
        link: Arc<dyn NodeLink>,
        machine: M,
        mailbox_tx: mpsc::Sender<Inbound>,
        mailbox_rx: mpsc::Receiver<Inbound>,
        down_rx: mpsc::UnboundedReceiver<DownNotice>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        let actor_name = actor_name(M::KIND, &scope);
        Self {
            scope,
            actor_name,
            link,
            machine,
            peers: HashMap::new(),
            mailbox_tx,
            mailbox_rx,
            down_rx,
            shutdown_rx,
        }
    }

    fn self_ref(&self) -> ActorRef {
        ActorRef {
            node: self.link.node().clone(),
            actor: self.actor_name.clone(),
        }
    }

    /// The main entry point of the scope actor task.
    pub async fn run(mut self) {
        let _registration = self
            .link
            .register_actor(&self.actor_name, self.mailbox_tx.clone());
        let mut members_rx = self.link.subscribe_members();
        let mut members_open = true;

        self.machine.rebuild_monitors();

        // Announce ourselves to every currently-visible peer node.
        for node in self.link.members() {
            self.send_discover(&node);
        }
        info!(scope = %self.scope, actor = %self.actor_name, "scope actor started");

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                Some(notice) = self.down_rx.recv() => {
                    let mut out = Outbox::new();
                    self.machine.handle_down(notice, &mut out);
                    self.flush(out);
                }
                inbound = self.mailbox_rx.recv() => {
                    match inbound {
                        Some(inbound) => self.handle_inbound(inbound),
                        None => break,
                    }
                }
                event = members_rx.recv(), if members_open => {
                    match event {
                        Ok(MemberEvent::Up(node)) => self.send_discover(&node),
                        // Node-down is advisory; the peer monitor DOWN is
                        // the authoritative purge signal.
                        Ok(MemberEvent::Down(_)) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(scope = %self.scope, missed, "membership events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => members_open = false,
                    }
                }
            }
        }
        info!(scope = %self.scope, actor = %self.actor_name, "scope actor stopped");
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Peer(envelope) => {
                if envelope.protocol != PROTOCOL_VERSION {
                    warn!(
                        scope = %self.scope,
                        protocol = %envelope.protocol,
                        "discarding message from incompatible peer"
                    );
                    return;
                }
                self.handle_peer_message(envelope.message);
            }
            Inbound::Request { req, reply } => {
                let mut out = Outbox::new();
                let outcome = self.machine.handle_request(req, &mut out);
                self.flush(out);
                let _ = reply.send(outcome);
            }
            Inbound::PeerDown { node } => {
                if self.peers.remove(&node).is_some() {
                    info!(scope = %self.scope, peer = %node, "peer scope actor down, purging its data");
                    self.machine.purge_node(&node);
                }
            }
        }
    }

    fn handle_peer_message(&mut self, message: ScopeMessage) {
        match message {
            ScopeMessage::Discover { from } => {
                debug!(scope = %self.scope, peer = %from.node, "received discover");
                self.upsert_peer(from.clone());
                self.send_ack_sync(&from);
            }
            ScopeMessage::AckSync { from, rows } => {
                debug!(scope = %self.scope, peer = %from.node, rows = rows.len(), "received ack-sync");
                let newly_discovered = self.upsert_peer(from.clone());
                let mut out = Outbox::new();
                self.machine.apply_snapshot(rows, &mut out);
                self.flush(out);
                // The peer may never have seen our DISCOVER; answer with our
                // own snapshot so both sides converge regardless.
                if newly_discovered {
                    self.send_ack_sync(&from);
                }
            }
            ScopeMessage::Sync(event) => {
                let mut out = Outbox::new();
                self.machine.apply_sync(event, &mut out);
                self.flush(out);
            }
        }
    }

    /// Records a remote actor handle, monitoring it when first seen.
    /// Returns `true` when the peer was not known before.
    fn upsert_peer(&mut self, remote: ActorRef) -> bool {
        if remote.node == *self.link.node() {
            return false;
        }
        if let Some(peer) = self.peers.get_mut(&remote.node) {
            peer.actor = remote;
            return false;
        }
        let monitor = self
            .link
            .monitor_actor(&remote.node, &remote.actor, self.mailbox_tx.clone());
        self.peers.insert(
            remote.node.clone(),
            Peer {
                actor: remote,
                _monitor: monitor,
            },
        );
        true
    }

    fn send_discover(&self, node: &NodeId) {
        self.link.send(
            node,
            &self.actor_name,
            Envelope::new(ScopeMessage::Discover {
                from: self.self_ref(),
            }),
        );
    }

    fn send_ack_sync(&self, to: &ActorRef) {
        let rows = self.machine.local_snapshot();
        self.link.send(
            &to.node,
            &to.actor,
            Envelope::new(ScopeMessage::AckSync {
                from: self.self_ref(),
                rows,
            }),
        );
    }

    /// Fans queued sync events out to all peers, minus each event's
    /// excluded requester.
    fn flush(&self, mut out: Outbox) {
        for (event, exclude) in out.drain() {
            for (node, peer) in &self.peers {
                if exclude.as_ref() == Some(node) {
                    continue;
                }
                self.link
                    .send(node, &peer.actor.actor, Envelope::new(ScopeMessage::Sync(event.clone())));
            }
        }
    }
}

// src/core/registry/mod.rs

//! The registry state machine: owner-side register/unregister, sync
//! replication, conflict resolution, and liveness-driven eviction.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::clock::MonotonicClock;
use crate::core::cluster::messages::{NodeId, RequestOutcome, ScopeRequest, SnapshotRow, SyncEvent};
use crate::core::events::{ConflictEntry, HandlerDispatch};
use crate::core::process::{DownNotice, ExitReason, MonitorRef, Pid, ProcessHost};
use crate::core::scope::{Outbox, ScopeMachine};
use crate::core::storage::{RegistryEntry, RegistryTables};

/// The registry machine of one scope on one node.
///
/// Owns the scope's table pair together with the actor driving it; all
/// mutation happens on the actor, reads go straight to the tables.
pub struct RegistryMachine {
    scope: String,
    local: NodeId,
    tables: Arc<RegistryTables>,
    host: Arc<ProcessHost>,
    clock: Arc<MonotonicClock>,
    dispatch: HandlerDispatch,
    down_tx: mpsc::UnboundedSender<DownNotice>,
    /// One shared monitor per locally-owned pid, reused across all names
    /// that pid holds in this scope.
    monitors: HashMap<Pid, MonitorRef>,
}

impl RegistryMachine {
    pub fn new(
        scope: String,
        tables: Arc<RegistryTables>,
        host: Arc<ProcessHost>,
        clock: Arc<MonotonicClock>,
        dispatch: HandlerDispatch,
        down_tx: mpsc::UnboundedSender<DownNotice>,
    ) -> Self {
        let local = host.node().clone();
        Self {
            scope,
            local,
            tables,
            host,
            clock,
            dispatch,
            down_tx,
            monitors: HashMap::new(),
        }
    }

    fn ensure_monitor(&mut self, pid: &Pid) -> MonitorRef {
        if let Some(mref) = self.monitors.get(pid) {
            return *mref;
        }
        let mref = self.host.monitor(pid, self.down_tx.clone());
        self.monitors.insert(pid.clone(), mref);
        mref
    }

    /// Releases the shared monitor once the pid holds no rows in this scope.
    fn maybe_demonitor(&mut self, pid: &Pid) {
        if self.tables.pid_rows_up_to(pid, 2) == 0 {
            if let Some(mref) = self.monitors.remove(pid) {
                self.host.demonitor(pid, mref);
            }
        }
    }

    fn register(
        &mut self,
        name: Bytes,
        pid: Pid,
        meta: Bytes,
        requester: NodeId,
        out: &mut Outbox,
    ) -> RequestOutcome {
        if !self.host.is_alive(&pid) {
            return RequestOutcome::NotAlive;
        }
        match self.tables.get(&name) {
            None => {
                let monitor = self.ensure_monitor(&pid);
                let time = self.clock.now();
                self.tables.insert(
                    name.clone(),
                    RegistryEntry {
                        pid: pid.clone(),
                        meta: meta.clone(),
                        time,
                        monitor: Some(monitor),
                        node: pid.node().clone(),
                    },
                );
                self.dispatch
                    .registered(&self.scope, &name, None, (pid.clone(), meta.clone()));
                out.broadcast_excluding(
                    SyncEvent::Register {
                        scope: self.scope.clone(),
                        name: name.to_vec(),
                        pid,
                        meta: meta.to_vec(),
                        time,
                    },
                    requester,
                );
                RequestOutcome::Registered {
                    prev_pid: None,
                    prev_meta: None,
                    time,
                }
            }
            Some(existing) if existing.pid == pid => {
                // Same pid re-registering: refresh meta/time in place. The
                // broadcast goes to every peer, requester included, so all
                // replicas converge on the refreshed tuple.
                let time = self.clock.now();
                self.tables.insert(
                    name.clone(),
                    RegistryEntry {
                        pid: pid.clone(),
                        meta: meta.clone(),
                        time,
                        monitor: existing.monitor,
                        node: existing.node.clone(),
                    },
                );
                self.dispatch.registered(
                    &self.scope,
                    &name,
                    Some((existing.pid.clone(), existing.meta.clone())),
                    (pid.clone(), meta.clone()),
                );
                out.broadcast(SyncEvent::Register {
                    scope: self.scope.clone(),
                    name: name.to_vec(),
                    pid,
                    meta: meta.to_vec(),
                    time,
                });
                RequestOutcome::Registered {
                    prev_pid: Some(existing.pid),
                    prev_meta: Some(existing.meta.to_vec()),
                    time,
                }
            }
            Some(_) => RequestOutcome::Taken,
        }
    }

    fn unregister(
        &mut self,
        name: Bytes,
        pid: Pid,
        requester: NodeId,
        out: &mut Outbox,
    ) -> RequestOutcome {
        match self.tables.get(&name) {
            None => RequestOutcome::Undefined,
            Some(existing) if existing.pid == pid => {
                let Some(entry) = self.tables.remove_if_pid(&name, &pid) else {
                    return RequestOutcome::Undefined;
                };
                self.maybe_demonitor(&pid);
                self.dispatch
                    .unregistered(&self.scope, &name, pid.clone(), entry.meta.clone());
                out.broadcast_excluding(
                    SyncEvent::Unregister {
                        name: name.to_vec(),
                        pid,
                        meta: entry.meta.to_vec(),
                    },
                    requester,
                );
                RequestOutcome::Unregistered {
                    meta: entry.meta.to_vec(),
                }
            }
            Some(_) => RequestOutcome::RaceCondition,
        }
    }

    fn apply_sync_register(
        &mut self,
        name: Bytes,
        pid: Pid,
        meta: Bytes,
        time: u64,
        out: &mut Outbox,
    ) {
        match self.tables.get(&name) {
            None => {
                self.tables.insert(
                    name.clone(),
                    RegistryEntry {
                        pid: pid.clone(),
                        meta: meta.clone(),
                        time,
                        monitor: None,
                        node: pid.node().clone(),
                    },
                );
                self.dispatch
                    .registered(&self.scope, &name, None, (pid, meta));
            }
            Some(existing) if existing.pid == pid => {
                // Same tuple: the timestamp decides, which also makes a
                // re-delivered broadcast a no-op.
                if time > existing.time {
                    self.tables.insert(
                        name.clone(),
                        RegistryEntry {
                            pid: pid.clone(),
                            meta: meta.clone(),
                            time,
                            monitor: existing.monitor,
                            node: existing.node.clone(),
                        },
                    );
                    self.dispatch.registered(
                        &self.scope,
                        &name,
                        Some((existing.pid, existing.meta)),
                        (pid, meta),
                    );
                }
            }
            Some(existing) if *existing.pid.node() == self.local => {
                // Two distinct pids hold the same name and ours is the local
                // one: this node is a party to the conflict.
                self.resolve_conflict(
                    name,
                    ConflictEntry { pid, meta, time },
                    existing,
                    out,
                );
            }
            Some(existing) => {
                // Both pids are remote: the newer registration wins.
                if existing.time < time {
                    self.tables.insert(
                        name.clone(),
                        RegistryEntry {
                            pid: pid.clone(),
                            meta: meta.clone(),
                            time,
                            monitor: None,
                            node: pid.node().clone(),
                        },
                    );
                    self.dispatch.unregistered(
                        &self.scope,
                        &name,
                        existing.pid,
                        existing.meta,
                    );
                    self.dispatch
                        .registered(&self.scope, &name, None, (pid, meta));
                }
            }
        }
    }

    /// Resolves a conflict this node is a party to. Both parties run this
    /// independently against the same two tuples; determinism comes from
    /// the resolver, not from any cross-node coordination.
    fn resolve_conflict(
        &mut self,
        name: Bytes,
        incoming: ConflictEntry,
        table: RegistryEntry,
        out: &mut Outbox,
    ) {
        let existing = ConflictEntry {
            pid: table.pid.clone(),
            meta: table.meta.clone(),
            time: table.time,
        };
        let choice = self
            .dispatch
            .resolve(&self.scope, &name, &incoming, &existing);

        if choice.as_ref() == Some(&incoming.pid) {
            // The remote registration wins: adopt it, kill ours. The remote
            // side keeps its own pid and rebroadcasts with a fresh stamp.
            info!(
                scope = %self.scope,
                winner = %incoming.pid,
                loser = %existing.pid,
                "registry conflict resolved for remote pid"
            );
            self.tables.insert(
                name.clone(),
                RegistryEntry {
                    pid: incoming.pid.clone(),
                    meta: incoming.meta.clone(),
                    time: incoming.time,
                    monitor: None,
                    node: incoming.pid.node().clone(),
                },
            );
            self.maybe_demonitor(&existing.pid);
            self.host.kill(
                &existing.pid,
                ExitReason::ResolveKill {
                    name: name.clone(),
                    meta: existing.meta.clone(),
                },
            );
            self.dispatch
                .unregistered(&self.scope, &name, existing.pid, existing.meta);
            self.dispatch
                .registered(&self.scope, &name, None, (incoming.pid, incoming.meta));
        } else if choice.as_ref() == Some(&existing.pid) {
            // Our registration wins: stamp it fresher than both tuples and
            // re-advertise so every replica converges on it.
            info!(
                scope = %self.scope,
                winner = %existing.pid,
                loser = %incoming.pid,
                "registry conflict resolved for local pid"
            );
            let time = self.clock.now_after(incoming.time.max(existing.time));
            self.tables.insert(
                name.clone(),
                RegistryEntry {
                    pid: existing.pid.clone(),
                    meta: existing.meta.clone(),
                    time,
                    monitor: table.monitor,
                    node: table.node,
                },
            );
            out.broadcast(SyncEvent::Register {
                scope: self.scope.clone(),
                name: name.to_vec(),
                pid: existing.pid,
                meta: existing.meta.to_vec(),
                time,
            });
        } else {
            // No usable preference: evict and kill our side. The other
            // party resolves symmetrically, so the name ends up free.
            warn!(
                scope = %self.scope,
                local = %existing.pid,
                remote = %incoming.pid,
                "registry conflict without resolution, evicting local pid"
            );
            self.tables.remove_if_pid(&name, &existing.pid);
            self.maybe_demonitor(&existing.pid);
            self.host.kill(
                &existing.pid,
                ExitReason::ResolveKill {
                    name: name.clone(),
                    meta: existing.meta.clone(),
                },
            );
            self.dispatch
                .unregistered(&self.scope, &name, existing.pid, existing.meta);
        }
    }
}

impl ScopeMachine for RegistryMachine {
    const KIND: &'static str = "registry";

    fn local_snapshot(&self) -> Vec<SnapshotRow> {
        self.tables
            .rows_on_node(&self.local)
            .into_iter()
            .map(|(name, entry)| SnapshotRow {
                key: name.to_vec(),
                pid: entry.pid,
                meta: entry.meta.to_vec(),
                time: entry.time,
            })
            .collect()
    }

    fn apply_snapshot(&mut self, rows: Vec<SnapshotRow>, out: &mut Outbox) {
        for row in rows {
            self.apply_sync_register(
                Bytes::from(row.key),
                row.pid,
                Bytes::from(row.meta),
                row.time,
                out,
            );
        }
    }

    fn apply_sync(&mut self, event: SyncEvent, out: &mut Outbox) {
        match event {
            SyncEvent::Register {
                scope,
                name,
                pid,
                meta,
                time,
            } => {
                if scope != self.scope {
                    warn!(%scope, "discarding sync-register for foreign scope");
                    return;
                }
                self.apply_sync_register(Bytes::from(name), pid, Bytes::from(meta), time, out);
            }
            SyncEvent::Unregister { name, pid, .. } => {
                let name = Bytes::from(name);
                if let Some(entry) = self.tables.remove_if_pid(&name, &pid) {
                    self.maybe_demonitor(&pid);
                    self.dispatch
                        .unregistered(&self.scope, &name, entry.pid, entry.meta);
                }
            }
            other => {
                warn!(scope = %self.scope, ?other, "registry actor discarding unknown sync event");
            }
        }
    }

    fn handle_request(&mut self, req: ScopeRequest, out: &mut Outbox) -> RequestOutcome {
        match req {
            ScopeRequest::Register {
                name,
                pid,
                meta,
                requester,
            } => self.register(Bytes::from(name), pid, Bytes::from(meta), requester, out),
            ScopeRequest::Unregister {
                name,
                pid,
                requester,
            } => self.unregister(Bytes::from(name), pid, requester, out),
            other => {
                warn!(scope = %self.scope, ?other, "registry actor discarding unknown request");
                RequestOutcome::Undefined
            }
        }
    }

    fn handle_down(&mut self, notice: DownNotice, out: &mut Outbox) {
        match self.monitors.get(&notice.pid) {
            Some(mref) if *mref == notice.monitor => {}
            _ => {
                debug!(scope = %self.scope, pid = %notice.pid, "ignoring flushed DOWN notice");
                return;
            }
        }
        self.monitors.remove(&notice.pid);
        for name in self.tables.names_of(&notice.pid) {
            if let Some(entry) = self.tables.remove_if_pid(&name, &notice.pid) {
                self.dispatch
                    .unregistered(&self.scope, &name, entry.pid.clone(), entry.meta.clone());
                out.broadcast(SyncEvent::Unregister {
                    name: name.to_vec(),
                    pid: entry.pid,
                    meta: entry.meta.to_vec(),
                });
            }
        }
    }

    fn purge_node(&mut self, node: &NodeId) {
        let removed = self.tables.purge_node(node);
        if removed.is_empty() {
            return;
        }
        info!(scope = %self.scope, peer = %node, count = removed.len(), "purged registrations of departed node");
        // The unregister callbacks run on a detached task so the actor
        // keeps draining its mailbox while user code walks the rows.
        let dispatch = self.dispatch.clone();
        let scope = self.scope.clone();
        tokio::spawn(async move {
            for (name, entry) in removed {
                dispatch.unregistered(&scope, &name, entry.pid, entry.meta);
            }
        });
    }

    fn rebuild_monitors(&mut self) {
        for (name, entry) in self.tables.rows_on_node(&self.local) {
            if self.host.is_alive(&entry.pid) {
                let mref = self.ensure_monitor(&entry.pid);
                self.tables.set_monitor(&name, Some(mref));
            } else {
                self.tables.remove_if_pid(&name, &entry.pid);
            }
        }
    }
}

// src/core/groups/mod.rs

//! The groups state machine: owner-side join/leave, sync replication, and
//! liveness-driven eviction.
//!
//! Simpler than the registry because `(group, pid)` is the key: two pids in
//! the same group coexist, so there is no conflict path. The owner's DOWN
//! path broadcasts a leave for every membership of the dead pid, symmetric
//! with the registry's unregister broadcast; peers hold no monitor on the
//! pid and would otherwise keep the member forever.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::clock::MonotonicClock;
use crate::core::cluster::messages::{NodeId, RequestOutcome, ScopeRequest, SnapshotRow, SyncEvent};
use crate::core::process::{DownNotice, MonitorRef, Pid, ProcessHost};
use crate::core::scope::{Outbox, ScopeMachine};
use crate::core::storage::{GroupEntry, GroupTables};

/// The groups machine of one scope on one node.
pub struct GroupsMachine {
    scope: String,
    local: NodeId,
    tables: Arc<GroupTables>,
    host: Arc<ProcessHost>,
    clock: Arc<MonotonicClock>,
    down_tx: mpsc::UnboundedSender<DownNotice>,
    /// One shared monitor per locally-owned pid, reused across all groups
    /// that pid joined in this scope.
    monitors: HashMap<Pid, MonitorRef>,
}

impl GroupsMachine {
    pub fn new(
        scope: String,
        tables: Arc<GroupTables>,
        host: Arc<ProcessHost>,
        clock: Arc<MonotonicClock>,
        down_tx: mpsc::UnboundedSender<DownNotice>,
    ) -> Self {
        let local = host.node().clone();
        Self {
            scope,
            local,
            tables,
            host,
            clock,
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

    fn maybe_demonitor(&mut self, pid: &Pid) {
        if self.tables.pid_rows_up_to(pid, 2) == 0 {
            if let Some(mref) = self.monitors.remove(pid) {
                self.host.demonitor(pid, mref);
            }
        }
    }

    fn join(
        &mut self,
        group: Bytes,
        pid: Pid,
        meta: Bytes,
        requester: NodeId,
        out: &mut Outbox,
    ) -> RequestOutcome {
        if !self.host.is_alive(&pid) {
            return RequestOutcome::NotAlive;
        }
        let monitor = self.ensure_monitor(&pid);
        let time = self.clock.now();
        self.tables.upsert(
            group.clone(),
            pid.clone(),
            GroupEntry {
                meta: meta.clone(),
                time,
                monitor: Some(monitor),
                node: pid.node().clone(),
            },
        );
        out.broadcast_excluding(
            SyncEvent::Join {
                group: group.to_vec(),
                pid,
                meta: meta.to_vec(),
                time,
            },
            requester,
        );
        RequestOutcome::Joined { time }
    }

    fn leave(
        &mut self,
        group: Bytes,
        pid: Pid,
        requester: NodeId,
        out: &mut Outbox,
    ) -> RequestOutcome {
        match self.tables.remove(&group, &pid) {
            None => RequestOutcome::Undefined,
            Some(entry) => {
                self.maybe_demonitor(&pid);
                out.broadcast_excluding(
                    SyncEvent::Leave {
                        group: group.to_vec(),
                        pid,
                        meta: entry.meta.to_vec(),
                    },
                    requester,
                );
                RequestOutcome::Left
            }
        }
    }
}

impl ScopeMachine for GroupsMachine {
    const KIND: &'static str = "pg";

    fn local_snapshot(&self) -> Vec<SnapshotRow> {
        self.tables
            .rows_on_node(&self.local)
            .into_iter()
            .map(|(group, pid, entry)| SnapshotRow {
                key: group.to_vec(),
                pid,
                meta: entry.meta.to_vec(),
                time: entry.time,
            })
            .collect()
    }

    fn apply_snapshot(&mut self, rows: Vec<SnapshotRow>, out: &mut Outbox) {
        for row in rows {
            self.apply_sync(
                SyncEvent::Join {
                    group: row.key,
                    pid: row.pid,
                    meta: row.meta,
                    time: row.time,
                },
                out,
            );
        }
    }

    fn apply_sync(&mut self, event: SyncEvent, _out: &mut Outbox) {
        match event {
            SyncEvent::Join {
                group,
                pid,
                meta,
                time,
            } => {
                let group = Bytes::from(group);
                match self.tables.get(&group, &pid) {
                    None => {
                        self.tables.upsert(
                            group,
                            pid.clone(),
                            GroupEntry {
                                meta: Bytes::from(meta),
                                time,
                                monitor: None,
                                node: pid.node().clone(),
                            },
                        );
                    }
                    Some(existing) if existing.time < time => {
                        self.tables.upsert(
                            group,
                            pid,
                            GroupEntry {
                                meta: Bytes::from(meta),
                                time,
                                monitor: existing.monitor,
                                node: existing.node,
                            },
                        );
                    }
                    // Ours is as new or newer: a replayed or reordered
                    // broadcast, drop it.
                    Some(_) => {}
                }
            }
            SyncEvent::Leave { group, pid, .. } => {
                let group = Bytes::from(group);
                if self.tables.remove(&group, &pid).is_some() {
                    self.maybe_demonitor(&pid);
                }
            }
            other => {
                warn!(scope = %self.scope, ?other, "groups actor discarding unknown sync event");
            }
        }
    }

    fn handle_request(&mut self, req: ScopeRequest, out: &mut Outbox) -> RequestOutcome {
        match req {
            ScopeRequest::Join {
                group,
                pid,
                meta,
                requester,
            } => self.join(Bytes::from(group), pid, Bytes::from(meta), requester, out),
            ScopeRequest::Leave {
                group,
                pid,
                requester,
            } => self.leave(Bytes::from(group), pid, requester, out),
            other => {
                warn!(scope = %self.scope, ?other, "groups actor discarding unknown request");
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
        for group in self.tables.groups_of(&notice.pid) {
            if let Some(entry) = self.tables.remove(&group, &notice.pid) {
                out.broadcast(SyncEvent::Leave {
                    group: group.to_vec(),
                    pid: notice.pid.clone(),
                    meta: entry.meta.to_vec(),
                });
            }
        }
    }

    fn purge_node(&mut self, node: &NodeId) {
        let removed = self.tables.purge_node(node);
        if !removed.is_empty() {
            info!(scope = %self.scope, peer = %node, count = removed.len(), "purged group memberships of departed node");
        }
    }

    fn rebuild_monitors(&mut self) {
        for (group, pid, _) in self.tables.rows_on_node(&self.local) {
            if self.host.is_alive(&pid) {
                let mref = self.ensure_monitor(&pid);
                self.tables.set_monitor(&group, &pid, Some(mref));
            } else {
                self.tables.remove(&group, &pid);
            }
        }
    }
}

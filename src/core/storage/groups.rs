// src/core/storage/groups.rs

//! The groups table pair: group → members, and a by-pid reverse index
//! (one pid may sit in many groups; a pid appears in a given group at most
//! once).

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};

use crate::core::cluster::messages::NodeId;
use crate::core::process::{MonitorRef, Pid};

/// One group membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub meta: Bytes,
    pub time: u64,
    /// Present only on the owning node; shared across all groups and names
    /// the pid holds there.
    pub monitor: Option<MonitorRef>,
    pub node: NodeId,
}

/// The tables of one groups scope. Empty groups are dropped eagerly so the
/// distinct-group count is simply the map length.
#[derive(Debug, Default)]
pub struct GroupTables {
    by_group: DashMap<Bytes, HashMap<Pid, GroupEntry>>,
    by_pid: DashMap<Pid, HashSet<Bytes>>,
}

impl GroupTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group: &Bytes, pid: &Pid) -> Option<GroupEntry> {
        self.by_group
            .get(group)
            .and_then(|members| members.get(pid).cloned())
    }

    /// Inserts or overwrites the `(group, pid)` row.
    pub fn upsert(&self, group: Bytes, pid: Pid, entry: GroupEntry) {
        self.by_group
            .entry(group.clone())
            .or_default()
            .insert(pid.clone(), entry);
        self.by_pid.entry(pid).or_default().insert(group);
    }

    /// Removes the `(group, pid)` row, dropping the group when it empties.
    pub fn remove(&self, group: &Bytes, pid: &Pid) -> Option<GroupEntry> {
        let removed = {
            let mut members = self.by_group.get_mut(group)?;
            members.remove(pid)
        };
        if removed.is_some() {
            self.by_group.remove_if(group, |_, members| members.is_empty());
            if let Some(mut groups) = self.by_pid.get_mut(pid) {
                groups.remove(group);
                if groups.is_empty() {
                    drop(groups);
                    self.by_pid.remove_if(pid, |_, groups| groups.is_empty());
                }
            }
        }
        removed
    }

    /// All `(pid, meta)` members of `group`.
    pub fn members(&self, group: &Bytes) -> Vec<(Pid, Bytes)> {
        self.by_group
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .map(|(pid, entry)| (pid.clone(), entry.meta.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Members of `group` whose pid runs on `node`.
    pub fn members_on_node(&self, group: &Bytes, node: &NodeId) -> Vec<(Pid, Bytes)> {
        self.by_group
            .get(group)
            .map(|members| {
                members
                    .iter()
                    .filter(|(_, entry)| entry.node == *node)
                    .map(|(pid, entry)| (pid.clone(), entry.meta.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All groups `pid` is a member of.
    pub fn groups_of(&self, pid: &Pid) -> Vec<Bytes> {
        self.by_pid
            .get(pid)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Counts rows for `pid`, stopping at `cap` (the demonitor refcount
    /// probe).
    pub fn pid_rows_up_to(&self, pid: &Pid, cap: usize) -> usize {
        self.by_pid
            .get(pid)
            .map(|groups| groups.len().min(cap))
            .unwrap_or(0)
    }

    /// The number of distinct non-empty groups.
    pub fn group_count(&self) -> usize {
        self.by_group.len()
    }

    /// The number of distinct groups with at least one member on `node`.
    pub fn group_count_on_node(&self, node: &NodeId) -> usize {
        self.by_group
            .iter()
            .filter(|entry| entry.value().values().any(|e| e.node == *node))
            .count()
    }

    /// All rows owned by `node`.
    pub fn rows_on_node(&self, node: &NodeId) -> Vec<(Bytes, Pid, GroupEntry)> {
        self.by_group
            .iter()
            .flat_map(|entry| {
                let group = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .filter(|(_, e)| e.node == *node)
                    .map(|(pid, e)| (group.clone(), pid.clone(), e.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Deletes every row owned by `node` and returns the removed rows.
    pub fn purge_node(&self, node: &NodeId) -> Vec<(Bytes, Pid, GroupEntry)> {
        let doomed = self.rows_on_node(node);
        for (group, pid, _) in &doomed {
            self.remove(group, pid);
        }
        doomed
    }

    /// Snapshot of every row; used by projections and tests.
    pub fn all_rows(&self) -> Vec<(Bytes, Pid, GroupEntry)> {
        self.by_group
            .iter()
            .flat_map(|entry| {
                let group = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .map(|(pid, e)| (group.clone(), pid.clone(), e.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Updates the stored monitor reference for `(group, pid)` in place.
    pub fn set_monitor(&self, group: &Bytes, pid: &Pid, monitor: Option<MonitorRef>) {
        if let Some(mut members) = self.by_group.get_mut(group) {
            if let Some(entry) = members.get_mut(pid) {
                entry.monitor = monitor;
            }
        }
    }
}

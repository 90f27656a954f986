// src/core/storage/registry.rs

//! The registry table pair: a unique by-name map and a by-pid reverse
//! index (one pid may hold many names).

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;

use crate::core::cluster::messages::NodeId;
use crate::core::process::{MonitorRef, Pid};

/// One registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub pid: Pid,
    pub meta: Bytes,
    pub time: u64,
    /// Present only on the owning node (the node holding the liveness
    /// monitor); shared across all names the pid holds there.
    pub monitor: Option<MonitorRef>,
    /// The owning node of `pid`, indexed for per-node selection and purge.
    pub node: NodeId,
}

/// The by-name / by-pid table pair of one registry scope.
#[derive(Debug, Default)]
pub struct RegistryTables {
    by_name: DashMap<Bytes, RegistryEntry>,
    by_pid: DashMap<Pid, HashSet<Bytes>>,
}

impl RegistryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &Bytes) -> Option<RegistryEntry> {
        self.by_name.get(name).map(|entry| entry.clone())
    }

    /// Inserts or overwrites the entry for `name`, keeping both indexes
    /// consistent.
    pub fn insert(&self, name: Bytes, entry: RegistryEntry) {
        if let Some(old) = self.by_name.insert(name.clone(), entry.clone()) {
            if old.pid != entry.pid {
                self.unindex_pid(&old.pid, &name);
            }
        }
        self.by_pid.entry(entry.pid).or_default().insert(name);
    }

    /// Removes the entry for `name` regardless of which pid holds it.
    pub fn remove(&self, name: &Bytes) -> Option<RegistryEntry> {
        let (_, entry) = self.by_name.remove(name)?;
        self.unindex_pid(&entry.pid, name);
        Some(entry)
    }

    /// Removes the row only when it matches both `name` and `pid`.
    pub fn remove_if_pid(&self, name: &Bytes, pid: &Pid) -> Option<RegistryEntry> {
        let removed = self
            .by_name
            .remove_if(name, |_, entry| entry.pid == *pid)?;
        self.unindex_pid(pid, name);
        Some(removed.1)
    }

    fn unindex_pid(&self, pid: &Pid, name: &Bytes) {
        if let Some(mut names) = self.by_pid.get_mut(pid) {
            names.remove(name);
            if names.is_empty() {
                drop(names);
                self.by_pid.remove_if(pid, |_, names| names.is_empty());
            }
        }
    }

    /// All names currently held by `pid`.
    pub fn names_of(&self, pid: &Pid) -> Vec<Bytes> {
        self.by_pid
            .get(pid)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Counts rows for `pid`, stopping at `cap`. The demonitor refcount only
    /// needs to know whether this row is the pid's last one, so it asks for
    /// at most two.
    pub fn pid_rows_up_to(&self, pid: &Pid, cap: usize) -> usize {
        self.by_pid
            .get(pid)
            .map(|names| names.len().min(cap))
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub fn count_on_node(&self, node: &NodeId) -> usize {
        self.by_name
            .iter()
            .filter(|entry| entry.value().node == *node)
            .count()
    }

    /// All rows owned by `node`, projected for a snapshot.
    pub fn rows_on_node(&self, node: &NodeId) -> Vec<(Bytes, RegistryEntry)> {
        self.by_name
            .iter()
            .filter(|entry| entry.value().node == *node)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Deletes every row owned by `node` from both indexes and returns the
    /// removed rows.
    pub fn purge_node(&self, node: &NodeId) -> Vec<(Bytes, RegistryEntry)> {
        let doomed = self.rows_on_node(node);
        for (name, entry) in &doomed {
            if self
                .by_name
                .remove_if(name, |_, e| e.pid == entry.pid)
                .is_some()
            {
                self.unindex_pid(&entry.pid, name);
            }
        }
        doomed
    }

    /// Snapshot of the whole by-name table; used by projections and tests.
    pub fn all_rows(&self) -> Vec<(Bytes, RegistryEntry)> {
        self.by_name
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Updates the stored monitor reference for `name` in place.
    pub fn set_monitor(&self, name: &Bytes, monitor: Option<MonitorRef>) {
        if let Some(mut entry) = self.by_name.get_mut(name) {
            entry.monitor = monitor;
        }
    }
}

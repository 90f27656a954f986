// src/core/process.rs

//! Process identity and the per-node liveness service.
//!
//! Roster does not run worker processes itself; it tracks their identity and
//! liveness. Each node owns a [`ProcessHost`]: embedders obtain a [`Pid`]
//! from [`ProcessHost::spawn`] when a worker starts and report its death
//! with [`ProcessHost::kill`]. The scope actors install monitors on local
//! pids and receive a [`DownNotice`] when a monitored pid exits.
//!
//! Only the owning node can observe a pid's liveness; remote pids are
//! opaque identity.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

use crate::core::cluster::messages::NodeId;

/// A cluster-unique process identifier carrying its owning node.
#[derive(
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct Pid {
    node: NodeId,
    serial: u64,
}

impl Pid {
    /// The node on which this process runs.
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}>", self.node, self.serial)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}.{}>", self.node, self.serial)
    }
}

/// Why a process exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The process terminated on its own.
    Normal,
    /// The process was killed by the embedder.
    Killed,
    /// The process lost a registry conflict and was killed by the conflict
    /// resolution procedure. Carries the contested name and the metadata
    /// the process was registered with.
    ResolveKill { name: Bytes, meta: Bytes },
}

/// A reference to a single monitor installed on a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorRef(u64);

/// Delivered to a monitor's channel when the monitored pid exits.
#[derive(Debug, Clone)]
pub struct DownNotice {
    pub pid: Pid,
    pub monitor: MonitorRef,
    pub reason: ExitReason,
}

struct ProcEntry {
    monitors: Vec<(MonitorRef, mpsc::UnboundedSender<DownNotice>)>,
    exit_tx: watch::Sender<Option<ExitReason>>,
}

/// A handle to a spawned process, held by the embedder.
///
/// The pid stays alive until [`ProcessHost::kill`] (or
/// [`ProcessHandle::exit`]) is called; dropping the handle does not kill it.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub pid: Pid,
    exit_rx: watch::Receiver<Option<ExitReason>>,
}

impl ProcessHandle {
    /// The exit reason, if the process has exited.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_rx.borrow().clone()
    }

    /// Waits until the process exits and returns the reason.
    pub async fn wait_exit(&mut self) -> ExitReason {
        loop {
            if let Some(reason) = self.exit_rx.borrow_and_update().clone() {
                return reason;
            }
            if self.exit_rx.changed().await.is_err() {
                return ExitReason::Normal;
            }
        }
    }
}

/// The per-node liveness service.
///
/// Tracks which local pids are alive, fans DOWN notices out to monitors,
/// and answers `is_alive` for local pids. Monitor channels are unbounded so
/// that a kill issued from inside a scope actor can never block on that
/// actor's own mailbox.
pub struct ProcessHost {
    node: NodeId,
    next_serial: AtomicU64,
    next_monitor: AtomicU64,
    procs: DashMap<u64, ProcEntry>,
}

impl ProcessHost {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            next_serial: AtomicU64::new(1),
            next_monitor: AtomicU64::new(1),
            procs: DashMap::new(),
        }
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Registers a new live process and returns its handle.
    pub fn spawn(&self) -> ProcessHandle {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let (exit_tx, exit_rx) = watch::channel(None);
        self.procs.insert(
            serial,
            ProcEntry {
                monitors: Vec::new(),
                exit_tx,
            },
        );
        ProcessHandle {
            pid: Pid {
                node: self.node.clone(),
                serial,
            },
            exit_rx,
        }
    }

    /// Whether `pid` is a live process on this node. Always `false` for
    /// remote pids: their liveness is only observable on their owner node.
    pub fn is_alive(&self, pid: &Pid) -> bool {
        pid.node == self.node && self.procs.contains_key(&pid.serial)
    }

    /// Installs a monitor on `pid`, delivering a [`DownNotice`] to `tx` when
    /// it exits. If the pid is already dead the notice is delivered
    /// immediately, mirroring monitor semantics on a vanished process.
    pub fn monitor(&self, pid: &Pid, tx: mpsc::UnboundedSender<DownNotice>) -> MonitorRef {
        let mref = MonitorRef(self.next_monitor.fetch_add(1, Ordering::Relaxed));
        if pid.node != self.node {
            // Monitoring a remote pid is a caller bug; report it dead.
            let _ = tx.send(DownNotice {
                pid: pid.clone(),
                monitor: mref,
                reason: ExitReason::Normal,
            });
            return mref;
        }
        match self.procs.get_mut(&pid.serial) {
            Some(mut entry) => entry.monitors.push((mref, tx)),
            None => {
                let _ = tx.send(DownNotice {
                    pid: pid.clone(),
                    monitor: mref,
                    reason: ExitReason::Normal,
                });
            }
        }
        mref
    }

    /// Removes a monitor. Flush semantics are cooperative: a notice already
    /// in flight carries a `MonitorRef` its owner no longer recognizes and
    /// is discarded on receipt.
    pub fn demonitor(&self, pid: &Pid, mref: MonitorRef) {
        if let Some(mut entry) = self.procs.get_mut(&pid.serial) {
            entry.monitors.retain(|(m, _)| *m != mref);
        }
    }

    /// Marks a local process dead and notifies its monitors.
    ///
    /// Returns `false` if the pid was not a live local process.
    pub fn kill(&self, pid: &Pid, reason: ExitReason) -> bool {
        if pid.node != self.node {
            return false;
        }
        let Some((_, entry)) = self.procs.remove(&pid.serial) else {
            return false;
        };
        let _ = entry.exit_tx.send(Some(reason.clone()));
        for (mref, tx) in entry.monitors {
            let _ = tx.send(DownNotice {
                pid: pid.clone(),
                monitor: mref,
                reason: reason.clone(),
            });
        }
        true
    }

    /// The number of live processes on this node.
    pub fn live_count(&self) -> usize {
        self.procs.len()
    }
}

impl fmt::Debug for ProcessHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHost")
            .field("node", &self.node)
            .field("live", &self.procs.len())
            .finish()
    }
}

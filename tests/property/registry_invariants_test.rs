// tests/property/registry_invariants_test.rs

//! Structural invariants of the registry machine under arbitrary operation
//! interleavings: the two indexes never diverge, a name maps to at most one
//! pid, and every local row is backed by a live monitor.

use bytes::Bytes;
use proptest::prelude::*;
use roster::core::clock::MonotonicClock;
use roster::core::cluster::messages::{NodeId, ScopeRequest, SyncEvent};
use roster::core::events::HandlerDispatch;
use roster::core::registry::RegistryMachine;
use roster::core::scope::{Outbox, ScopeMachine};
use roster::core::storage::RegistryTables;
use roster::{ExitReason, Pid, ProcessHost};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

const NAMES: usize = 6;
const LOCAL_PIDS: usize = 4;
const REMOTE_PIDS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Register { name: usize, pid: usize },
    Unregister { name: usize },
    Kill { pid: usize },
    SyncRegister { name: usize, pid: usize, time: u64 },
    SyncUnregister { name: usize, pid: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..NAMES, 0..LOCAL_PIDS).prop_map(|(name, pid)| Op::Register { name, pid }),
        (0..NAMES).prop_map(|name| Op::Unregister { name }),
        (0..LOCAL_PIDS).prop_map(|pid| Op::Kill { pid }),
        (0..NAMES, 0..REMOTE_PIDS, 1u64..1_000).prop_map(|(name, pid, time)| {
            Op::SyncRegister { name, pid, time }
        }),
        (0..NAMES, 0..REMOTE_PIDS).prop_map(|(name, pid)| Op::SyncUnregister { name, pid }),
    ]
}

struct Harness {
    machine: RegistryMachine,
    tables: Arc<RegistryTables>,
    host: Arc<ProcessHost>,
    down_rx: mpsc::UnboundedReceiver<roster::core::process::DownNotice>,
    local: NodeId,
    local_pids: Vec<Pid>,
    remote_pids: Vec<Pid>,
}

impl Harness {
    fn new() -> Self {
        let local = NodeId::new("a1");
        let tables = Arc::new(RegistryTables::new());
        let host = Arc::new(ProcessHost::new(local.clone()));
        let (down_tx, down_rx) = mpsc::unbounded_channel();
        let machine = RegistryMachine::new(
            "default".to_string(),
            tables.clone(),
            host.clone(),
            Arc::new(MonotonicClock::new()),
            HandlerDispatch::default(),
            down_tx,
        );
        let local_pids = (0..LOCAL_PIDS).map(|_| host.spawn().pid).collect();
        let remote_host = ProcessHost::new(NodeId::new("b1"));
        let remote_pids = (0..REMOTE_PIDS).map(|_| remote_host.spawn().pid).collect();
        Self {
            machine,
            tables,
            host,
            down_rx,
            local,
            local_pids,
            remote_pids,
        }
    }

    fn name(&self, index: usize) -> Bytes {
        Bytes::from(format!("n{index}"))
    }

    fn drain_downs(&mut self) {
        while let Ok(notice) = self.down_rx.try_recv() {
            let mut out = Outbox::new();
            self.machine.handle_down(notice, &mut out);
        }
    }

    fn apply(&mut self, op: &Op) {
        let mut out = Outbox::new();
        match op {
            Op::Register { name, pid } => {
                self.machine.handle_request(
                    ScopeRequest::Register {
                        name: self.name(*name).to_vec(),
                        pid: self.local_pids[*pid].clone(),
                        meta: vec![],
                        requester: self.local.clone(),
                    },
                    &mut out,
                );
            }
            Op::Unregister { name } => {
                let name = self.name(*name);
                if let Some(entry) = self.tables.get(&name) {
                    self.machine.handle_request(
                        ScopeRequest::Unregister {
                            name: name.to_vec(),
                            pid: entry.pid,
                            requester: self.local.clone(),
                        },
                        &mut out,
                    );
                }
            }
            Op::Kill { pid } => {
                self.host
                    .kill(&self.local_pids[*pid], ExitReason::Killed);
                self.drain_downs();
            }
            Op::SyncRegister { name, pid, time } => {
                self.machine.apply_sync(
                    SyncEvent::Register {
                        scope: "default".to_string(),
                        name: self.name(*name).to_vec(),
                        pid: self.remote_pids[*pid].clone(),
                        meta: vec![],
                        time: *time,
                    },
                    &mut out,
                );
            }
            Op::SyncUnregister { name, pid } => {
                self.machine.apply_sync(
                    SyncEvent::Unregister {
                        name: self.name(*name).to_vec(),
                        pid: self.remote_pids[*pid].clone(),
                        meta: vec![],
                    },
                    &mut out,
                );
            }
        }
    }

    /// Every row appears in both indexes, and no pid row points at a name
    /// held by someone else.
    fn assert_cross_index_consistency(&self) {
        let rows = self.tables.all_rows();
        let mut seen = HashSet::new();
        for (name, entry) in &rows {
            assert!(seen.insert(name.clone()), "name indexed twice: {name:?}");
            assert!(
                self.tables.names_of(&entry.pid).contains(name),
                "by-name row missing from by-pid index"
            );
        }
        let mut reverse_total = 0;
        for pid in self.local_pids.iter().chain(self.remote_pids.iter()) {
            for name in self.tables.names_of(pid) {
                reverse_total += 1;
                let entry = self
                    .tables
                    .get(&name)
                    .expect("by-pid row without a by-name row");
                assert_eq!(&entry.pid, pid, "indexes disagree on the holder");
            }
        }
        assert_eq!(reverse_total, rows.len(), "dangling by-pid rows");
    }

    /// Killing every local process must clear all locally-owned rows: each
    /// of them was backed by a live monitor.
    fn assert_local_rows_are_monitored(&mut self) {
        for pid in self.local_pids.clone() {
            self.host.kill(&pid, ExitReason::Killed);
        }
        self.drain_downs();
        assert_eq!(
            self.tables.count_on_node(&self.local),
            0,
            "a local row survived the death of every local process"
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 500,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_registry_invariants_hold_under_any_interleaving(
        ops in prop::collection::vec(op_strategy(), 1..80)
    ) {
        let mut harness = Harness::new();
        for op in &ops {
            harness.apply(op);
            harness.assert_cross_index_consistency();
        }
        harness.assert_local_rows_are_monitored();
        harness.assert_cross_index_consistency();
    }
}

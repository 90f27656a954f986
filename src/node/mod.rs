// src/node/mod.rs

//! Node bootstrap and the public API surface.
//!
//! A [`Node`] attaches to a mesh, brings up a registry actor and a groups
//! actor per configured scope, and exposes the user-facing operations.
//! Reads (`lookup`, `members`, counts) are served straight from the scope
//! tables without touching the actors; writes are routed to the actor on
//! the owner node of the target pid, and a successful remote write is
//! mirrored into the local tables before returning so the caller reads its
//! own write.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::info;

use crate::config::{Config, DEFAULT_SCOPE};
use crate::core::clock::MonotonicClock;
use crate::core::cluster::bus::{ClusterBus, Inbound, NodeLink};
use crate::core::cluster::messages::{NodeId, RequestOutcome, ScopeRequest};
use crate::core::errors::RosterError;
use crate::core::events::{DefaultHandler, EventHandler, HandlerDispatch};
use crate::core::groups::GroupsMachine;
use crate::core::process::{Pid, ProcessHandle, ProcessHost};
use crate::core::registry::RegistryMachine;
use crate::core::scope::{ScopeActor, ScopeMachine, actor_name};
use crate::core::storage::{GroupEntry, GroupTables, RegistryEntry, RegistryTables};

/// The result of a successful registration: the pre-existing `(pid, meta)`
/// under the name, if any, and the registration time assigned by the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub previous: Option<(Pid, Bytes)>,
    pub time: u64,
}

struct ScopeServices {
    registry_tables: Arc<RegistryTables>,
    group_tables: Arc<GroupTables>,
    registry_tx: mpsc::Sender<Inbound>,
    groups_tx: mpsc::Sender<Inbound>,
    registry_actor: String,
    groups_actor: String,
}

struct NodeInner {
    node: NodeId,
    link: Arc<dyn NodeLink>,
    host: Arc<ProcessHost>,
    scopes: HashMap<String, ScopeServices>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<JoinSet<()>>,
}

/// One cluster node's handle to roster.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Starts a node with the default (no-op) event handler.
    pub fn start(config: Config, bus: &dyn ClusterBus) -> Result<Self> {
        Self::start_with_handler(config, bus, Arc::new(DefaultHandler))
    }

    /// Starts a node: attaches to the mesh and spawns a registry actor and
    /// a groups actor for every configured scope.
    pub fn start_with_handler(
        config: Config,
        bus: &dyn ClusterBus,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self> {
        config.validate().context("invalid roster configuration")?;

        let node = NodeId::new(config.node.clone());
        let link = bus.attach(node.clone());
        let host = Arc::new(ProcessHost::new(node.clone()));
        let clock = Arc::new(MonotonicClock::new());
        let dispatch = HandlerDispatch::new(handler);
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = JoinSet::new();
        let mut scopes = HashMap::new();

        for scope in config.effective_scopes() {
            let registry_tables = Arc::new(RegistryTables::new());
            let group_tables = Arc::new(GroupTables::new());

            let (registry_tx, registry_rx) = mpsc::channel(config.mailbox_capacity);
            let (reg_down_tx, reg_down_rx) = mpsc::unbounded_channel();
            let registry = RegistryMachine::new(
                scope.clone(),
                registry_tables.clone(),
                host.clone(),
                clock.clone(),
                dispatch.clone(),
                reg_down_tx,
            );
            tasks.spawn(
                ScopeActor::new(
                    scope.clone(),
                    link.clone(),
                    registry,
                    registry_tx.clone(),
                    registry_rx,
                    reg_down_rx,
                    shutdown_tx.subscribe(),
                )
                .run(),
            );

            let (groups_tx, groups_rx) = mpsc::channel(config.mailbox_capacity);
            let (pg_down_tx, pg_down_rx) = mpsc::unbounded_channel();
            let groups = GroupsMachine::new(
                scope.clone(),
                group_tables.clone(),
                host.clone(),
                clock.clone(),
                pg_down_tx,
            );
            tasks.spawn(
                ScopeActor::new(
                    scope.clone(),
                    link.clone(),
                    groups,
                    groups_tx.clone(),
                    groups_rx,
                    pg_down_rx,
                    shutdown_tx.subscribe(),
                )
                .run(),
            );

            scopes.insert(
                scope.clone(),
                ScopeServices {
                    registry_tables,
                    group_tables,
                    registry_tx,
                    groups_tx,
                    registry_actor: actor_name(RegistryMachine::KIND, &scope),
                    groups_actor: actor_name(GroupsMachine::KIND, &scope),
                },
            );
        }

        info!(node = %node, scopes = scopes.len(), "roster node started");
        Ok(Self {
            inner: Arc::new(NodeInner {
                node,
                link,
                host,
                scopes,
                shutdown_tx,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    /// Stops every scope actor of this node and waits for them to exit.
    /// Peers observe the actors going down and purge this node's data.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(());
        let mut tasks = self.inner.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        info!(node = %self.inner.node, "roster node stopped");
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node
    }

    /// The per-node liveness service; embedders register their worker
    /// processes here.
    pub fn processes(&self) -> &Arc<ProcessHost> {
        &self.inner.host
    }

    /// Shorthand for `processes().spawn()`.
    pub fn spawn_process(&self) -> ProcessHandle {
        self.inner.host.spawn()
    }

    /// The API of one scope.
    ///
    /// # Panics
    ///
    /// Accessing a scope this node was not configured with is a programming
    /// error and panics.
    pub fn scope<'a>(&'a self, scope: &'a str) -> ScopeApi<'a> {
        let Some(services) = self.inner.scopes.get(scope) else {
            panic!(
                "invalid scope '{scope}': node '{}' does not host it",
                self.inner.node
            );
        };
        ScopeApi {
            inner: &self.inner,
            scope,
            services,
        }
    }

    // --- Convenience API on the default scope ---

    pub fn lookup(&self, name: impl AsRef<[u8]>) -> Option<(Pid, Bytes)> {
        self.scope(DEFAULT_SCOPE).lookup(name)
    }

    pub async fn register(
        &self,
        name: impl Into<Bytes>,
        pid: Pid,
        meta: impl Into<Bytes>,
    ) -> Result<Registration, RosterError> {
        self.scope(DEFAULT_SCOPE).register(name, pid, meta).await
    }

    pub async fn unregister(&self, name: impl AsRef<[u8]>) -> Result<(), RosterError> {
        self.scope(DEFAULT_SCOPE).unregister(name).await
    }

    pub fn count(&self) -> usize {
        self.scope(DEFAULT_SCOPE).count()
    }

    pub async fn join(
        &self,
        group: impl Into<Bytes>,
        pid: Pid,
        meta: impl Into<Bytes>,
    ) -> Result<u64, RosterError> {
        self.scope(DEFAULT_SCOPE).join(group, pid, meta).await
    }

    pub async fn leave(
        &self,
        group: impl AsRef<[u8]>,
        pid: &Pid,
    ) -> Result<(), RosterError> {
        self.scope(DEFAULT_SCOPE).leave(group, pid).await
    }

    pub fn members(&self, group: impl AsRef<[u8]>) -> Vec<(Pid, Bytes)> {
        self.scope(DEFAULT_SCOPE).members(group)
    }

    pub fn group_count(&self) -> usize {
        self.scope(DEFAULT_SCOPE).group_count()
    }
}

/// The operations of one scope on one node.
pub struct ScopeApi<'a> {
    inner: &'a NodeInner,
    scope: &'a str,
    services: &'a ScopeServices,
}

impl ScopeApi<'_> {
    /// The name of this scope.
    pub fn name(&self) -> &str {
        self.scope
    }

    fn local_node(&self) -> &NodeId {
        &self.inner.node
    }

    async fn request(
        &self,
        owner: &NodeId,
        mailbox: &mpsc::Sender<Inbound>,
        actor: &str,
        req: ScopeRequest,
    ) -> Result<RequestOutcome, RosterError> {
        if owner == self.local_node() {
            let (reply_tx, reply_rx) = oneshot::channel();
            mailbox
                .send(Inbound::Request {
                    req,
                    reply: reply_tx,
                })
                .await
                .map_err(|_| RosterError::Transport("local scope actor is gone".into()))?;
            reply_rx
                .await
                .map_err(|_| RosterError::Transport("local scope actor dropped the call".into()))
        } else {
            self.inner.link.call(owner, actor, req).await
        }
    }

    // --- Registry ---

    /// Looks the name up in the local replica. No network round-trip.
    pub fn lookup(&self, name: impl AsRef<[u8]>) -> Option<(Pid, Bytes)> {
        let name = Bytes::copy_from_slice(name.as_ref());
        self.services
            .registry_tables
            .get(&name)
            .map(|entry| (entry.pid, entry.meta))
    }

    /// Registers `name -> pid` with `meta`, routed to the owner node of
    /// `pid`.
    pub async fn register(
        &self,
        name: impl Into<Bytes>,
        pid: Pid,
        meta: impl Into<Bytes>,
    ) -> Result<Registration, RosterError> {
        let name: Bytes = name.into();
        let meta: Bytes = meta.into();
        let owner = pid.node().clone();
        let outcome = self
            .request(
                &owner,
                &self.services.registry_tx,
                &self.services.registry_actor,
                ScopeRequest::Register {
                    name: name.to_vec(),
                    pid: pid.clone(),
                    meta: meta.to_vec(),
                    requester: self.local_node().clone(),
                },
            )
            .await?;
        match outcome {
            RequestOutcome::Registered {
                prev_pid,
                prev_meta,
                time,
            } => {
                if owner != *self.local_node() {
                    // Mirror the owner's mutation so our own reads see it
                    // before the broadcast arrives. No monitor: only the
                    // owner watches the pid.
                    self.services.registry_tables.insert(
                        name,
                        RegistryEntry {
                            pid,
                            meta,
                            time,
                            monitor: None,
                            node: owner,
                        },
                    );
                }
                let previous = match (prev_pid, prev_meta) {
                    (Some(p), Some(m)) => Some((p, Bytes::from(m))),
                    _ => None,
                };
                Ok(Registration { previous, time })
            }
            RequestOutcome::NotAlive => Err(RosterError::NotAlive),
            RequestOutcome::Taken => Err(RosterError::Taken),
            RequestOutcome::RaceCondition => Err(RosterError::RaceCondition),
            RequestOutcome::Undefined => Err(RosterError::Undefined),
            other => Err(RosterError::Transport(format!(
                "unexpected register reply: {other:?}"
            ))),
        }
    }

    /// Unregisters `name`, routed to the owner node of the pid currently
    /// registered under it.
    pub async fn unregister(&self, name: impl AsRef<[u8]>) -> Result<(), RosterError> {
        let name = Bytes::copy_from_slice(name.as_ref());
        let Some((pid, _)) = self.lookup(&name) else {
            return Err(RosterError::Undefined);
        };
        let owner = pid.node().clone();
        let outcome = self
            .request(
                &owner,
                &self.services.registry_tx,
                &self.services.registry_actor,
                ScopeRequest::Unregister {
                    name: name.to_vec(),
                    pid: pid.clone(),
                    requester: self.local_node().clone(),
                },
            )
            .await?;
        match outcome {
            RequestOutcome::Unregistered { .. } => {
                if owner != *self.local_node() {
                    self.services.registry_tables.remove_if_pid(&name, &pid);
                }
                Ok(())
            }
            RequestOutcome::Undefined => Err(RosterError::Undefined),
            RequestOutcome::RaceCondition => Err(RosterError::RaceCondition),
            other => Err(RosterError::Transport(format!(
                "unexpected unregister reply: {other:?}"
            ))),
        }
    }

    /// The number of names registered in this scope, cluster-wide as seen
    /// from the local replica.
    pub fn count(&self) -> usize {
        self.services.registry_tables.len()
    }

    /// The number of names registered to processes owned by `node`.
    pub fn count_on_node(&self, node: &NodeId) -> usize {
        self.services.registry_tables.count_on_node(node)
    }

    // --- Groups ---

    /// Adds `pid` to `group` with `meta`, routed to the owner node of
    /// `pid`. Joining again updates the metadata in place.
    pub async fn join(
        &self,
        group: impl Into<Bytes>,
        pid: Pid,
        meta: impl Into<Bytes>,
    ) -> Result<u64, RosterError> {
        let group: Bytes = group.into();
        let meta: Bytes = meta.into();
        let owner = pid.node().clone();
        let outcome = self
            .request(
                &owner,
                &self.services.groups_tx,
                &self.services.groups_actor,
                ScopeRequest::Join {
                    group: group.to_vec(),
                    pid: pid.clone(),
                    meta: meta.to_vec(),
                    requester: self.local_node().clone(),
                },
            )
            .await?;
        match outcome {
            RequestOutcome::Joined { time } => {
                if owner != *self.local_node() {
                    self.services.group_tables.upsert(
                        group,
                        pid,
                        GroupEntry {
                            meta,
                            time,
                            monitor: None,
                            node: owner,
                        },
                    );
                }
                Ok(time)
            }
            RequestOutcome::NotAlive => Err(RosterError::NotAlive),
            other => Err(RosterError::Transport(format!(
                "unexpected join reply: {other:?}"
            ))),
        }
    }

    /// Removes `pid` from `group`, routed to the owner node of `pid`.
    pub async fn leave(&self, group: impl AsRef<[u8]>, pid: &Pid) -> Result<(), RosterError> {
        let group = Bytes::copy_from_slice(group.as_ref());
        let owner = pid.node().clone();
        let outcome = self
            .request(
                &owner,
                &self.services.groups_tx,
                &self.services.groups_actor,
                ScopeRequest::Leave {
                    group: group.to_vec(),
                    pid: pid.clone(),
                    requester: self.local_node().clone(),
                },
            )
            .await?;
        match outcome {
            RequestOutcome::Left => {
                if owner != *self.local_node() {
                    self.services.group_tables.remove(&group, pid);
                }
                Ok(())
            }
            RequestOutcome::Undefined => Err(RosterError::Undefined),
            other => Err(RosterError::Transport(format!(
                "unexpected leave reply: {other:?}"
            ))),
        }
    }

    /// All `(pid, meta)` members of `group`, as seen from the local replica.
    pub fn members(&self, group: impl AsRef<[u8]>) -> Vec<(Pid, Bytes)> {
        let group = Bytes::copy_from_slice(group.as_ref());
        self.services.group_tables.members(&group)
    }

    /// The members of `group` whose processes run on this node.
    pub fn local_members(&self, group: impl AsRef<[u8]>) -> Vec<(Pid, Bytes)> {
        let group = Bytes::copy_from_slice(group.as_ref());
        self.services
            .group_tables
            .members_on_node(&group, self.local_node())
    }

    /// The number of distinct non-empty groups in this scope.
    pub fn group_count(&self) -> usize {
        self.services.group_tables.group_count()
    }

    /// The number of distinct groups with at least one member on `node`.
    pub fn group_count_on_node(&self, node: &NodeId) -> usize {
        self.services.group_tables.group_count_on_node(node)
    }
}

// src/core/events.rs

//! User-visible lifecycle callbacks and the dispatch layer that invokes
//! them safely.
//!
//! Callbacks run inline in the scope actors (except the peer-down purge,
//! which runs on a detached task), so a misbehaving handler must never take
//! the actor down with it: every invocation is wrapped in `catch_unwind`,
//! failures are logged, and a safe default is substituted: no side effect
//! for the lifecycle hooks, no preference for the conflict resolver.

use bytes::Bytes;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

use crate::core::process::Pid;

/// One side of a registry conflict, as passed to the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub pid: Pid,
    pub meta: Bytes,
    pub time: u64,
}

/// The callbacks a roster embedder can implement.
///
/// All methods have default implementations, so a handler only overrides
/// what it cares about.
pub trait EventHandler: Send + Sync + 'static {
    /// A name became registered (`previous` is `None`), or an existing
    /// registration was overwritten in place (re-registration or conflict
    /// resolution).
    fn on_process_registered(
        &self,
        scope: &str,
        name: &Bytes,
        previous: Option<(Pid, Bytes)>,
        current: (Pid, Bytes),
    ) {
        let _ = (scope, name, previous, current);
    }

    /// A registration went away: explicit unregister, process death,
    /// replicated removal, peer purge, or conflict eviction.
    fn on_process_unregistered(&self, scope: &str, name: &Bytes, pid: Pid, meta: Bytes) {
        let _ = (scope, name, pid, meta);
    }

    /// Two distinct pids hold the same name on two nodes. Return the pid to
    /// keep; any other value (including `None`) makes *each* side evict and
    /// kill its own local pid, so a symmetric conflict resolves to no entry.
    ///
    /// That is the default. Production deployments that need a survivor
    /// should override this with a deterministic pick, for example the
    /// entry with the lower registration time, or a choice keyed on
    /// metadata.
    fn resolve_registry_conflict(
        &self,
        scope: &str,
        name: &Bytes,
        incoming: &ConflictEntry,
        existing: &ConflictEntry,
    ) -> Option<Pid> {
        let _ = (scope, name, incoming, existing);
        None
    }
}

/// The no-op handler used when the embedder installs none.
#[derive(Debug, Default)]
pub struct DefaultHandler;

impl EventHandler for DefaultHandler {}

/// Invokes an [`EventHandler`] with panic isolation.
#[derive(Clone)]
pub struct HandlerDispatch {
    handler: Arc<dyn EventHandler>,
}

impl HandlerDispatch {
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self { handler }
    }

    pub fn registered(
        &self,
        scope: &str,
        name: &Bytes,
        previous: Option<(Pid, Bytes)>,
        current: (Pid, Bytes),
    ) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.handler
                .on_process_registered(scope, name, previous, current)
        }));
        if result.is_err() {
            warn!(scope, "on_process_registered callback panicked; ignoring");
        }
    }

    pub fn unregistered(&self, scope: &str, name: &Bytes, pid: Pid, meta: Bytes) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.handler.on_process_unregistered(scope, name, pid, meta)
        }));
        if result.is_err() {
            warn!(scope, "on_process_unregistered callback panicked; ignoring");
        }
    }

    /// Runs the conflict resolver; a panicking resolver counts as "no
    /// preference".
    pub fn resolve(
        &self,
        scope: &str,
        name: &Bytes,
        incoming: &ConflictEntry,
        existing: &ConflictEntry,
    ) -> Option<Pid> {
        match catch_unwind(AssertUnwindSafe(|| {
            self.handler
                .resolve_registry_conflict(scope, name, incoming, existing)
        })) {
            Ok(choice) => choice,
            Err(_) => {
                warn!(scope, "resolve_registry_conflict callback panicked; treating as no preference");
                None
            }
        }
    }
}

impl Default for HandlerDispatch {
    fn default() -> Self {
        Self::new(Arc::new(DefaultHandler))
    }
}

impl std::fmt::Debug for HandlerDispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HandlerDispatch")
    }
}

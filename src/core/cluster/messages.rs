// src/core/cluster/messages.rs

//! The inter-node wire protocol.
//!
//! Every envelope is tagged with [`PROTOCOL_VERSION`]; a receiver discards
//! envelopes from an incompatible peer. Binary payloads travel as `Vec<u8>`
//! on the wire and live as `bytes::Bytes` in the tables.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::process::Pid;

/// The version tag carried by every inter-node message.
pub const PROTOCOL_VERSION: &str = "3.0";

/// The cluster-unique name of a node.
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
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A location-transparent handle to a remote scope actor: the transport
/// resolves `(node, actor)` to a concrete endpoint on send.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct ActorRef {
    pub node: NodeId,
    pub actor: String,
}

/// One row of an anti-entropy snapshot: `(Name, Pid, Meta, Time)` for the
/// registry, `(GroupName, Pid, Meta, Time)` for groups.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct SnapshotRow {
    pub key: Vec<u8>,
    pub pid: Pid,
    pub meta: Vec<u8>,
    pub time: u64,
}

/// A broadcast replication event.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum SyncEvent {
    Register {
        scope: String,
        name: Vec<u8>,
        pid: Pid,
        meta: Vec<u8>,
        time: u64,
    },
    Unregister {
        name: Vec<u8>,
        pid: Pid,
        meta: Vec<u8>,
    },
    Join {
        group: Vec<u8>,
        pid: Pid,
        meta: Vec<u8>,
        time: u64,
    },
    Leave {
        group: Vec<u8>,
        pid: Pid,
        meta: Vec<u8>,
    },
}

/// The messages exchanged between scope actors of the same scope.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ScopeMessage {
    /// Broadcast by a starting actor (and on node-up) to announce itself.
    Discover { from: ActorRef },
    /// Point-to-point reply to a DISCOVER: the sender's local data snapshot.
    AckSync {
        from: ActorRef,
        rows: Vec<SnapshotRow>,
    },
    /// A replication event, broadcast to all peers.
    Sync(SyncEvent),
}

/// A version-tagged wire envelope.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Envelope {
    pub protocol: String,
    pub message: ScopeMessage,
}

impl Envelope {
    pub fn new(message: ScopeMessage) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            message,
        }
    }

    /// Encodes the envelope for a byte-oriented transport.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decodes an envelope received from a byte-oriented transport.
    pub fn decode(buf: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(buf, bincode::config::standard()).map(|(env, _)| env)
    }
}

/// A synchronous request routed to the owner node's scope actor.
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum ScopeRequest {
    Register {
        name: Vec<u8>,
        pid: Pid,
        meta: Vec<u8>,
        requester: NodeId,
    },
    Unregister {
        name: Vec<u8>,
        pid: Pid,
        requester: NodeId,
    },
    Join {
        group: Vec<u8>,
        pid: Pid,
        meta: Vec<u8>,
        requester: NodeId,
    },
    Leave {
        group: Vec<u8>,
        pid: Pid,
        requester: NodeId,
    },
}

/// The owner node's reply to a [`ScopeRequest`].
#[derive(
    Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum RequestOutcome {
    Registered {
        prev_pid: Option<Pid>,
        prev_meta: Option<Vec<u8>>,
        time: u64,
    },
    Unregistered {
        meta: Vec<u8>,
    },
    Joined {
        time: u64,
    },
    Left,
    NotAlive,
    Taken,
    RaceCondition,
    Undefined,
}
